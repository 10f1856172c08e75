pub mod backend_connection;
pub mod backend_db;
pub mod backend_host;
pub mod backend_signal;
pub mod backend_worker;
pub mod model_loader;
