//! Snapshot streaming to a remote receiver.
//!
//! One worker per transfer, all owned by a [`Supervisor`]:
//!
//! ```text
//! +------------+  Begin   +-----------+
//! |   Worker   | -------> |  control  | ---> receiver meta port
//! |            |          +-----------+
//! |            |   acks   +-----------+
//! |            | <------- | AckRouter | <--- receiver ack connection
//! |            |          +-----------+
//! |            |  chunks  +-----------+
//! |            | -------> |  DataBus  | ---> receiver data port
//! +------------+          +-----------+
//! ```
//!
//! Data bus messages are `<transfer id><payload>`, where the payload is raw
//! diff bytes or one of the `END_SUCCESS` / `END_FAIL` sentinels.

pub mod channel;
pub mod liveness;
pub mod protocol;
pub mod sender;
pub mod supervisor;

pub use channel::{
    ack_channel, data_bus, AckInbox, AckSender, AckWaitError, DataBus, DataBusReceiver, DataSink,
    TransferStats, ACK_TIMEOUT,
};
pub use liveness::LivenessMonitor;
pub use protocol::{AckKind, AckMessage, ControlMessage, DataFrame, DataPayload, END_FAIL, END_SUCCESS};
pub use sender::{
    FailurePolicy, ReplicationWorker, TransferAbort, TransferReport, TransferRequest, WorkerConfig,
    WorkerContext, EXIT_FAILURE_CODE,
};
pub use supervisor::{AckRouter, Supervisor, TransferHandle};
