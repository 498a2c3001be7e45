use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "./downloads/.tasks.sqlite";
pub const DB_PATH_ENV: &str = "ORANGE_TASKS_DB";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), ..Self::default() }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_connections: 5,
        }
    }
}
