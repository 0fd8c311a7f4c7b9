use serde_json::Value;

use crate::error::{Result, ScanError};
use crate::scanner::{Extracted, Module};
use crate::types::{MongoDb, ProtocolRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDbModule;

impl Module for MongoDbModule {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn record_keys(&self) -> &'static [&'static str] {
        &["mongodb", "mongo"]
    }

    fn extract(&self, result: &Value) -> Result<Extracted> {
        let is_master = match result.get("is_master") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                return Err(ScanError::attach_failure(
                    self.name(),
                    format!("is_master is not a bool: {}", other),
                ));
            }
        };
        let build_info = match result.get("build_info") {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(ScanError::attach_failure(
                    self.name(),
                    format!("build_info is not an object: {}", other),
                ));
            }
            None => return Err(ScanError::attach_failure(self.name(), "missing build_info")),
        };

        let record = MongoDb::new(is_master, build_info);
        let version = record.version().map(str::to_string);
        Ok(Extracted {
            record: ProtocolRecord::MongoDb(record),
            version,
        })
    }
}
