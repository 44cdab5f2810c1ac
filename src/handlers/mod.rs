pub mod blob_handlers;
pub mod file_entry_handlers;
pub mod file_handlers;
pub mod health_handlers;
mod upload_form;
