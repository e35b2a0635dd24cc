use crate::core::config::data::Config;
use crate::core::config::keys::KEYS;

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        for line in self.describe() {
            println!("  {line}");
        }
        println!("  effective backend: {}", self.base_url());
    }

    pub(crate) fn describe(&self) -> Vec<String> {
        KEYS.iter()
            .map(|key| match self.get_value(key) {
                Ok(Some(value)) => format!("{key}: {value}"),
                _ => format!("{key}: (unset)"),
            })
            .collect()
    }
}
