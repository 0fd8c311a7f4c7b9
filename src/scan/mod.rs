pub mod mongodb;
pub mod smtp;

pub use mongodb::MongoDbModule;
pub use smtp::SmtpModule;

use crate::scanner::Module;

pub fn create_default_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(MongoDbModule),
        Box::new(SmtpModule),
    ]
}

/// Looks a module up by its zgrab2 name (or a record alias such as `mongo`).
pub fn module_for(name: &str) -> Option<Box<dyn Module>> {
    let name = name.to_ascii_lowercase();
    create_default_modules()
        .into_iter()
        .find(|m| m.name() == name || m.record_keys().contains(&name.as_str()))
}
