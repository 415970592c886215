use minionlink_crypt::KeyMaterial;
use minionlink_frame::Value;

use crate::cmd::KeygenArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat, Record};

pub fn run(_args: KeygenArgs, format: OutputFormat) -> CliResult<i32> {
    let key = KeyMaterial::generate();
    let hex = key.to_hex();
    print_record(
        &Record::new("key").payload(&Value::from(hex.as_str())),
        format,
    );
    Ok(SUCCESS)
}
