pub mod data;
pub mod defaults;
pub mod io;
pub mod keys;
pub mod printing;


pub use data::Config;
pub use io::ConfigError;
