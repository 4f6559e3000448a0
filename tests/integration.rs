#[path = "integration/cli.rs"]
mod cli;
#[path = "integration/scheduler.rs"]
mod scheduler;
#[path = "integration/workers.rs"]
mod workers;
