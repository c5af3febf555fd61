use fcc_core::wire::{CallPayload, MulticallPayload, WireMsg};
use fcc_core::CallSpec;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Correlates an outbound request with its reply. Ids keep increasing across
/// reconnects so a late reply can never be mistaken for a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Call(CallSpec),
    Multicall(Vec<CallSpec>),
}

impl RequestBody {
    /// Method name used in logs; a multicall is named after its first call.
    pub fn method(&self) -> &str {
        match self {
            RequestBody::Call(call) => &call.method,
            RequestBody::Multicall(calls) => calls
                .first()
                .map(|call| call.method.as_str())
                .unwrap_or("multicall"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub id: CallId,
    pub body: RequestBody,
}

impl OutboundRequest {
    pub fn into_wire(self) -> WireMsg {
        match self.body {
            RequestBody::Call(call) => WireMsg::Call(CallPayload {
                id: self.id.0,
                call,
            }),
            RequestBody::Multicall(calls) => WireMsg::Multicall(MulticallPayload {
                id: self.id.0,
                calls,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("remote channel closed")]
pub struct ChannelClosed;

/// Outbound half of the remote call channel. Replies and notifications come
/// back to the session as events; a send never blocks.
pub trait RemoteChannel: Send {
    fn send(&mut self, request: OutboundRequest) -> Result<(), ChannelClosed>;
}

/// Channel double that records every request it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<OutboundRequest>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Drains the log, returning what was recorded since the last drain.
    pub fn take(&self) -> Vec<OutboundRequest> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|request| request.body.method().to_string())
            .collect()
    }

    /// Makes every later send fail as if the peer went away.
    pub fn close(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
    }
}

impl RemoteChannel for RecordingChannel {
    fn send(&mut self, request: OutboundRequest) -> Result<(), ChannelClosed> {
        if self.closed.lock().map(|closed| *closed).unwrap_or(true) {
            return Err(ChannelClosed);
        }
        self.sent.lock().map_err(|_| ChannelClosed)?.push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_map_onto_wire_messages() {
        let call = OutboundRequest {
            id: CallId(7),
            body: RequestBody::Call(CallSpec::new("readtemp_temp", vec![json!(0)])),
        };
        match call.into_wire() {
            WireMsg::Call(payload) => {
                assert_eq!(payload.id, 7);
                assert_eq!(payload.call.method, "readtemp_temp");
            }
            other => panic!("unexpected {other:?}"),
        }

        let batch = OutboundRequest {
            id: CallId(8),
            body: RequestBody::Multicall(vec![
                CallSpec::new("pause", vec![json!(true)]),
                CallSpec::new("confirm", vec![]),
            ]),
        };
        assert_eq!(batch.body.method(), "pause");
        assert!(matches!(batch.into_wire(), WireMsg::Multicall(p) if p.calls.len() == 2));
    }

    #[test]
    fn recording_channel_shares_its_log() {
        let recorder = RecordingChannel::new();
        let mut channel: Box<dyn RemoteChannel> = Box::new(recorder.clone());
        channel
            .send(OutboundRequest {
                id: CallId(1),
                body: RequestBody::Call(CallSpec::new("home_all", vec![])),
            })
            .expect("open");
        assert_eq!(recorder.methods(), vec!["home_all"]);
        assert_eq!(recorder.take().len(), 1);
        assert!(recorder.sent().is_empty());

        recorder.close();
        let refused = channel.send(OutboundRequest {
            id: CallId(2),
            body: RequestBody::Call(CallSpec::new("home_all", vec![])),
        });
        assert_eq!(refused, Err(ChannelClosed));
    }
}
