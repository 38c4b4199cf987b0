pub mod oracle;
pub mod report;
pub mod resolve;
pub mod resume;
pub mod settings;
pub mod snapshot;
pub mod types;
