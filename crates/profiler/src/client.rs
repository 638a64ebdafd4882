//! Target-server client interface (spec section 6 consumer side)
//!
//! The wire protocol endpoint is an external collaborator (spec section 1,
//! Out of scope); this trait is the client-side mirror of the scheduler
//! crate's `Backend` trait — the minimal shape the load manager needs to
//! drive a target server, without depending on any particular transport.

use multiserve_common::Result;
use multiserve_proto::{RequestPayload, ResponsePayload};

/// One inference round trip against the target server. Blocking from the
/// caller's perspective; the load manager achieves concurrency by running
/// several calls concurrently as tasks, not by this trait being async
/// (spec section 9, "Cooperative vs parallel": any concurrency model
/// supporting waited-on completion is acceptable).
pub trait TargetClient: Send + Sync {
    fn infer(&self, request: &RequestPayload) -> Result<ResponsePayload>;
}

/// A client that loops a request's inputs back as outputs with a
/// configurable artificial delay. Used by tests and by the profiler binary
/// when no real transport is wired in, mirroring `IdentityLoader` in the
/// scheduler crate.
pub struct EchoClient {
    pub latency: std::time::Duration,
}

impl EchoClient {
    pub fn new(latency: std::time::Duration) -> Self {
        Self { latency }
    }
}

impl TargetClient for EchoClient {
    fn infer(&self, request: &RequestPayload) -> Result<ResponsePayload> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(ResponsePayload {
            outputs: request.inputs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn echo_client_returns_inputs_as_outputs() {
        let client = EchoClient::new(std::time::Duration::ZERO);
        let request = RequestPayload {
            model_name: "m".into(),
            model_version: 1,
            inputs: HashMap::new(),
            correlation_id: None,
            sequence_start: true,
            sequence_end: true,
        };
        let response = client.infer(&request).unwrap();
        assert!(response.outputs.is_empty());
    }
}
