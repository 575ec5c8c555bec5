pub mod api;
pub mod auth;
pub mod background;
pub mod db;
pub mod router;
pub mod startup;
pub mod state;
pub mod ws;

pub fn load_config() -> seg_core::Config {
    seg_core::config::load_dotenv();
    seg_core::Config::from_env()
}
