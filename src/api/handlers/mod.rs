pub mod health;
pub mod sftp;
