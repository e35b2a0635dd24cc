//! `palaver config` subcommands

use std::error::Error;

use crate::cli::ConfigCommands;
use crate::core::config::data::path_display;
use crate::core::config::Config;

pub fn run_config(command: ConfigCommands) -> Result<(), Box<dyn Error>> {
    let path = Config::get_config_path()?;
    match command {
        ConfigCommands::Show => Config::load_from_path(&path)?.print_all(),
        ConfigCommands::Get { key } => {
            let config = Config::load_from_path(&path)?;
            match config.get_value(&key)? {
                Some(value) => println!("{value}"),
                None => println!("(unset)"),
            }
        }
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load_from_path(&path)?;
            config.set_value(&key, &value)?;
            config.save_to_path(&path)?;
            println!("✅ Set {key} to: {value}");
        }
        ConfigCommands::Unset { key } => {
            let mut config = Config::load_from_path(&path)?;
            config.unset_value(&key)?;
            config.save_to_path(&path)?;
            println!("✅ Unset {key}");
        }
        ConfigCommands::Path => println!("{}", path_display(&path)),
    }
    Ok(())
}
