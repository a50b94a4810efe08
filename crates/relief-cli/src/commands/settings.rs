use relief_core::SyncSettings;

use crate::error::CliError;

pub fn run_settings(settings: &SyncSettings) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
