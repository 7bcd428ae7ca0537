pub mod codec;
pub mod dispatcher;
pub mod memory;
pub mod session_pool;
pub mod sftp;
pub mod staging;
pub mod transfer_service;
pub mod uploader;
pub mod worker;
