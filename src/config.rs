use clap::ValueEnum;

/// Placement policy selected at manager startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SchedulerKind {
    #[default]
    Epvm,
    Greedy,
    RoundRobin,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Epvm => write!(f, "epvm"),
            SchedulerKind::Greedy => write!(f, "greedy"),
            SchedulerKind::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// Backing store for task and event records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DbKind {
    #[default]
    Memory,
    Persistent,
}

impl std::fmt::Display for DbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbKind::Memory => write!(f, "memory"),
            DbKind::Persistent => write!(f, "persistent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    /// Worker addresses in `host:port` form.
    pub workers: Vec<String>,
    pub scheduler: SchedulerKind,
    pub db_type: DbKind,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5555,
            workers: vec!["localhost:5556".to_string()],
            scheduler: SchedulerKind::Epvm,
            db_type: DbKind::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub db_type: DbKind,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5556,
            name: format!("worker-{}", uuid::Uuid::new_v4()),
            db_type: DbKind::Memory,
        }
    }
}
