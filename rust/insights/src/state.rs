use crate::query::InsightsEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: InsightsEngine,
}

impl AppState {
    pub fn new(engine: InsightsEngine) -> Self {
        Self { engine }
    }
}
