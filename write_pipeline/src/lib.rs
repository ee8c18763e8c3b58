mod capability;
mod file_write_handler;
mod handler_chain;
mod packet_queue;
mod packet_writer;
mod request_context;
mod write_handler;
mod writer_pool;

pub use capability::*;
pub use file_write_handler::*;
pub use handler_chain::*;
pub use packet_queue::*;
pub use packet_writer::*;
pub use request_context::*;
pub use write_handler::*;
pub use writer_pool::*;

#[cfg(test)]
mod test_pipeline;
