pub mod diffusion;
pub mod models;
pub mod trainers;

// Re-export common types
pub use diffusion::{ConditioningContext, DenoisingNetwork, KarrasDiffusion, NetworkOutput};
pub use trainers::{load_config, Config};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
