mod config;
mod document;
mod principal;

pub use config::{
  CollectionConfig, CollectionOptions, DefaultValue, EventConfig, FieldType, NowSentinel, PropertyConfig,
  ScriptLanguage, StorageMode, EVENT_NAMES,
};
pub use document::Document;
pub use principal::Principal;
