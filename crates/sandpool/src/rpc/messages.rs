//! Typed requests and replies carried in [`Frame`]s.

use serde::{Deserialize, Serialize};

use super::frame::{Frame, MessageType};
use crate::types::{
    DbOutcome, DbQuery, Error, ExecutionId, ExecutionListing, Result, WorkOrder, WorkResult,
    WorkerId,
};

/// Payload of `CancelWorkerExecutions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub worker_id: String,
}

/// Reply to `CancelWorkerExecutions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReply {
    pub cancelled_execution_ids: Vec<ExecutionId>,
}

/// Payload of `NotifyWorkerReady`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyNotice {
    pub worker_id: WorkerId,
}

/// Payload of a `Fault` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// A decoded request
#[derive(Debug, Clone)]
pub enum Request {
    Execute(WorkOrder),
    ListCurrentExecutions,
    CancelWorkerExecutions(CancelRequest),
    QueryWorkerDb(DbQuery),
    NotifyWorkerReady(ReadyNotice),
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Execute(_) => MessageType::Execute,
            Request::ListCurrentExecutions => MessageType::ListCurrentExecutions,
            Request::CancelWorkerExecutions(_) => MessageType::CancelWorkerExecutions,
            Request::QueryWorkerDb(_) => MessageType::QueryWorkerDb,
            Request::NotifyWorkerReady(_) => MessageType::NotifyWorkerReady,
        }
    }

    pub fn into_frame(self, request_id: u64) -> Result<Frame> {
        let msg_type = self.message_type();
        match self {
            Request::Execute(order) => Frame::json(msg_type, request_id, &order),
            Request::ListCurrentExecutions => Ok(Frame::new(msg_type, request_id, Vec::new())),
            Request::CancelWorkerExecutions(req) => Frame::json(msg_type, request_id, &req),
            Request::QueryWorkerDb(query) => Frame::json(msg_type, request_id, &query),
            Request::NotifyWorkerReady(notice) => Frame::json(msg_type, request_id, &notice),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.msg_type {
            MessageType::Execute => Ok(Request::Execute(frame.parse_json()?)),
            MessageType::ListCurrentExecutions => Ok(Request::ListCurrentExecutions),
            MessageType::CancelWorkerExecutions => {
                Ok(Request::CancelWorkerExecutions(frame.parse_json()?))
            }
            MessageType::QueryWorkerDb => Ok(Request::QueryWorkerDb(frame.parse_json()?)),
            MessageType::NotifyWorkerReady => Ok(Request::NotifyWorkerReady(frame.parse_json()?)),
            MessageType::Reply | MessageType::Fault => Err(Error::Protocol(format!(
                "Expected a request, got {:?}",
                frame.msg_type
            ))),
        }
    }
}

/// A reply produced by a request handler
#[derive(Debug, Clone)]
pub enum Reply {
    Executed(WorkResult),
    Executions(ExecutionListing),
    Cancelled(CancelReply),
    Queried(DbOutcome),
    Ack,
}

impl Reply {
    pub fn into_frame(self, request_id: u64) -> Result<Frame> {
        let msg_type = MessageType::Reply;
        match self {
            Reply::Executed(result) => Frame::json(msg_type, request_id, &result),
            Reply::Executions(listing) => Frame::json(msg_type, request_id, &listing),
            Reply::Cancelled(reply) => Frame::json(msg_type, request_id, &reply),
            Reply::Queried(outcome) => Frame::json(msg_type, request_id, &outcome),
            Reply::Ack => Frame::json(msg_type, request_id, &serde_json::Value::Null),
        }
    }
}

/// Frame reporting that a request failed on the remote side
pub fn fault_frame(request_id: u64, error: &Error) -> Frame {
    let fault = Fault {
        message: error.to_string(),
        retryable: error.is_retryable(),
    };
    let payload = serde_json::to_vec(&fault).unwrap_or_default();
    Frame::new(MessageType::Fault, request_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_round_trip_keeps_type() {
        let order = WorkOrder::new("e1", "acme", "main", "export default {}").with_worker("w1");
        let frame = Request::Execute(order).into_frame(3).unwrap();
        assert_eq!(frame.msg_type, MessageType::Execute);
        assert_eq!(frame.request_id, 3);

        match Request::from_frame(&frame).unwrap() {
            Request::Execute(order) => {
                assert_eq!(order.execution_id, "e1");
                assert_eq!(order.worker_id.as_deref(), Some("w1"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_reply_frame_is_not_a_request() {
        let frame = Reply::Ack.into_frame(1).unwrap();
        assert!(matches!(Request::from_frame(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_fault_frame_carries_message() {
        let frame = fault_frame(9, &Error::TooMuchWork { max: 4 });
        assert_eq!(frame.msg_type, MessageType::Fault);
        let fault: Fault = frame.parse_json().unwrap();
        assert!(fault.message.contains("Too much work"));
        assert!(fault.retryable);
    }
}
