use crate::services::accession_service::AccessionService;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub accessions: AccessionService,

    /// Token staff present as `Authorization: Bearer <token>`.
    pub staff_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(accessions: AccessionService, staff_token: Option<String>) -> Self {
        Self {
            accessions,
            staff_token: staff_token.map(Arc::from),
        }
    }
}
