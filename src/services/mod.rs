pub mod accession_service;
pub mod archive;
pub mod content_store;
pub mod metadata;
