pub mod accession_handlers;
pub mod health_handlers;
