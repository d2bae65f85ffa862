pub mod bus;
pub mod deadline;
pub mod distributor;
pub mod ingestion;
pub mod lifecycle;
pub mod rpc;
pub mod scan_dispatcher;
pub mod scanner;
pub mod storage;
pub mod worker;
