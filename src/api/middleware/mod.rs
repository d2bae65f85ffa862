pub mod deadline;
pub mod request_id;
