pub mod chunk_store;
pub mod digest;
pub mod slice_producer;
pub mod transport;
pub mod upload_service;
pub mod upload_synchronizer;
pub mod uploader;
