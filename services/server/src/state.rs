use sqlx::PgPool;
use std::sync::Arc;

use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(pool: PgPool, hub: Arc<Hub>) -> Self {
        Self { pool, hub }
    }
}
