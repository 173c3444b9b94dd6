//! Channel lifecycle, id allocation and close propagation for the
//! multiplexer described in spec §4.2. The wire codec itself
//! (`tether_protocol::mux::{MuxFrame, FrameType}`) is the leaf dependency;
//! this module is the registry/state-machine layer on top of it, grounded
//! on `signaling.rs`'s `ChannelRegistry`/`SignalingChannel` pattern
//! (`Arc<RwLock<HashMap<K, Arc<V>>>>`) generalized from "one broadcast
//! channel per session" to "a tree of nested mux channels per connection".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use tether_protocol::{CloseChannelPayload, FrameType, MuxFrame};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Fired on a channel's owner when the peer announces a new child via an
/// inbound `CreateChannel` frame.
pub struct ChannelAnnounce {
    pub channel: Arc<Channel>,
    pub init: Vec<u8>,
    pub data_rx: mpsc::UnboundedReceiver<MuxFrame>,
    /// Announcements of *this* channel's own peer-created children (e.g. an
    /// FSLS session channel's per-operation grandchildren).
    pub announce_rx: mpsc::UnboundedReceiver<ChannelAnnounce>,
}

enum Parent {
    /// The root channel's parent is the raw transport: encoded outer frames
    /// are pushed straight onto the owning WebSocket's write task.
    Root(mpsc::UnboundedSender<Vec<u8>>),
    Channel(Arc<Channel>),
}

struct ChannelInner {
    state: ChannelState,
    pending: VecDeque<(FrameType, Vec<u8>)>,
    next_child_id: u32,
}

/// A logical channel: the root (id 0, wrapping a raw WebSocket) or a nested
/// channel addressed by an id allocated by its creator.
pub struct Channel {
    pub id: u32,
    parent: Parent,
    inner: RwLock<ChannelInner>,
    children: RwLock<HashMap<u32, Arc<Channel>>>,
    announces: mpsc::UnboundedSender<ChannelAnnounce>,
    data_tx: mpsc::UnboundedSender<MuxFrame>,
}

impl Channel {
    /// Wrap a raw outer transport (the sender half of the socket's write
    /// task) as the root channel. The root is always OPEN: it inherits the
    /// socket's own state.
    pub fn new_root(
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> (
        Arc<Channel>,
        mpsc::UnboundedReceiver<MuxFrame>,
        mpsc::UnboundedReceiver<ChannelAnnounce>,
    ) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel {
            id: 0,
            parent: Parent::Root(sink),
            inner: RwLock::new(ChannelInner {
                state: ChannelState::Open,
                pending: VecDeque::new(),
                next_child_id: 1,
            }),
            children: RwLock::new(HashMap::new()),
            announces: announce_tx,
            data_tx,
        });
        (channel, data_rx, announce_rx)
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.read().await.state
    }

    async fn is_open(&self) -> bool {
        self.inner.read().await.state == ChannelState::Open
    }

    /// Allocate an id for a locally-created child: advance past any
    /// occupied id, wrapping at 2^32; fail if a full wrap finds none free.
    async fn allocate_child_id(&self) -> Result<u32, GatewayError> {
        let children = self.children.read().await;
        let mut inner = self.inner.write().await;
        let start = inner.next_child_id;
        loop {
            let candidate = inner.next_child_id;
            inner.next_child_id = inner.next_child_id.wrapping_add(1);
            if !children.contains_key(&candidate) {
                return Ok(candidate);
            }
            if inner.next_child_id == start {
                return Err(GatewayError::CapacityExhausted(
                    "multiplexer channel ids exhausted on this parent".into(),
                ));
            }
        }
    }

    /// Send a frame toward the root, wrapping in a `Data` frame at every
    /// nested parent crossed, so the outermost write carries the full
    /// addressing chain down to the deepest grandchild.
    fn dispatch_up(&self, frame: MuxFrame) -> Result<(), GatewayError> {
        match &self.parent {
            Parent::Root(sink) => sink.send(frame.encode()).map_err(|_| GatewayError::PeerClosed),
            Parent::Channel(parent) => {
                let wrapped = MuxFrame::new(FrameType::Data, self.id, frame.encode());
                parent.dispatch_up(wrapped)
            }
        }
    }

    /// Create a locally-initiated child, announcing it via `CreateChannel`.
    /// The child enters OPEN once this channel is itself OPEN, asynchronously
    /// (spec §4.2: "on the next turn of the event loop").
    pub async fn create_child(
        self: &Arc<Self>,
        init: Vec<u8>,
    ) -> Result<
        (
            Arc<Channel>,
            mpsc::UnboundedReceiver<MuxFrame>,
            mpsc::UnboundedReceiver<ChannelAnnounce>,
        ),
        GatewayError,
    > {
        let id = self.allocate_child_id().await?;
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let child = Arc::new(Channel {
            id,
            parent: Parent::Channel(Arc::clone(self)),
            inner: RwLock::new(ChannelInner {
                state: ChannelState::Connecting,
                pending: VecDeque::new(),
                next_child_id: 1,
            }),
            children: RwLock::new(HashMap::new()),
            announces: announce_tx,
            data_tx,
        });
        self.children.write().await.insert(id, Arc::clone(&child));

        self.dispatch_up(MuxFrame::new(FrameType::CreateChannel, id, init))?;

        let child_for_open = Arc::clone(&child);
        let parent_for_open = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::task::yield_now().await;
                if parent_for_open.is_open().await {
                    break;
                }
            }
            let mut inner = child_for_open.inner.write().await;
            if inner.state == ChannelState::Connecting {
                inner.state = ChannelState::Open;
                let queued: Vec<_> = inner.pending.drain(..).collect();
                drop(inner);
                for (frame_type, payload) in queued {
                    let frame = MuxFrame::new(frame_type, child_for_open.id, payload);
                    let _ = child_for_open.dispatch_up(frame);
                }
            }
        });

        Ok((child, data_rx, announce_rx))
    }

    /// Send application data on this channel (queues while CONNECTING,
    /// errors while CLOSING/CLOSED).
    pub async fn send(&self, frame_type: FrameType, payload: Vec<u8>) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ChannelState::Open => {
                drop(inner);
                self.dispatch_up(MuxFrame::new(frame_type, self.id, payload))
            }
            ChannelState::Connecting => {
                inner.pending.push_back((frame_type, payload));
                Ok(())
            }
            ChannelState::Closing | ChannelState::Closed => Err(GatewayError::InvalidState(
                "write to a CLOSING or CLOSED channel".into(),
            )),
        }
    }

    /// Close this channel and all descendants. Closing the root is handled
    /// by the caller (it closes the underlying WebSocket); this only
    /// propagates a `CloseChannel` frame for non-root channels.
    pub async fn close(self: &Arc<Self>, code: u16, reason: String) -> Result<(), GatewayError> {
        {
            let state = self.inner.read().await.state;
            if state == ChannelState::Closed || state == ChannelState::Closing {
                return Ok(());
            }
        }
        self.inner.write().await.state = ChannelState::Closing;

        let children: Vec<_> = self.children.read().await.values().cloned().collect();
        for child in children {
            let _ = Box::pin(child.close(1000, "parent closed".to_string())).await;
        }
        self.children.write().await.clear();

        if self.id != 0 {
            let payload = CloseChannelPayload::new(code, reason).encode();
            self.dispatch_up(MuxFrame::new(FrameType::CloseChannel, self.id, payload))?;
        }

        self.inner.write().await.state = ChannelState::Closed;
        Ok(())
    }

    /// Route an inbound frame addressed either at this channel (`Raw*`
    /// payloads meant for its own owner) or at one of its children
    /// (`CreateChannel`/`CloseChannel`/`Data`).
    pub async fn handle_inbound(self: &Arc<Self>, frame: MuxFrame) -> Result<(), GatewayError> {
        match frame.frame_type {
            FrameType::CreateChannel => {
                let child_id = frame.channel_id;
                {
                    let mut inner = self.inner.write().await;
                    if child_id >= inner.next_child_id {
                        inner.next_child_id = child_id.wrapping_add(1);
                    }
                }
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                let (announce_tx, announce_rx) = mpsc::unbounded_channel();
                let child = Arc::new(Channel {
                    id: child_id,
                    parent: Parent::Channel(Arc::clone(self)),
                    inner: RwLock::new(ChannelInner {
                        state: ChannelState::Open,
                        pending: VecDeque::new(),
                        next_child_id: 1,
                    }),
                    children: RwLock::new(HashMap::new()),
                    announces: announce_tx,
                    data_tx,
                });
                self.children.write().await.insert(child_id, Arc::clone(&child));
                let _ = self.announces.send(ChannelAnnounce {
                    channel: child,
                    init: frame.payload,
                    data_rx,
                    announce_rx,
                });
                Ok(())
            }
            FrameType::CloseChannel => {
                if let Some(child) = self.children.write().await.remove(&frame.channel_id) {
                    child.inner.write().await.state = ChannelState::Closed;
                }
                // Unknown id: silent no-op, per spec §4.2.
                Ok(())
            }
            FrameType::Data => {
                let inner_frame = MuxFrame::decode(&frame.payload)
                    .map_err(|e| GatewayError::ProtocolViolation(e.to_string()))?;
                if let Some(child) = self.children.read().await.get(&frame.channel_id).cloned() {
                    Box::pin(child.handle_inbound(inner_frame)).await
                } else {
                    Ok(())
                }
            }
            FrameType::RawBinaryData | FrameType::RawStringData => {
                if frame.channel_id == self.id {
                    let _ = self.data_tx.send(frame);
                } else if let Some(child) = self.children.read().await.get(&frame.channel_id).cloned() {
                    let _ = child.data_tx.send(frame);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_sink() -> (
        Arc<Channel>,
        mpsc::UnboundedReceiver<MuxFrame>,
        mpsc::UnboundedReceiver<ChannelAnnounce>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (root, data_rx, announce_rx) = Channel::new_root(sink_tx);
        (root, data_rx, announce_rx, sink_rx)
    }

    #[tokio::test]
    async fn root_starts_open() {
        let (root, _data_rx, _announce_rx, _sink_rx) = root_with_sink();
        assert_eq!(root.state().await, ChannelState::Open);
    }

    #[tokio::test]
    async fn create_child_announces_then_opens() {
        let (root, _data_rx, _announce_rx, mut sink_rx) = root_with_sink();
        let (child, _child_data_rx, _child_announce_rx) =
            root.create_child(b"SHEL".to_vec()).await.unwrap();
        assert_eq!(child.id, 1);

        let raw = sink_rx.recv().await.unwrap();
        let frame = MuxFrame::decode(&raw).unwrap();
        assert_eq!(frame.frame_type, FrameType::CreateChannel);
        assert_eq!(frame.channel_id, 1);
        assert_eq!(frame.payload, b"SHEL");

        // Give the spawned open-transition task a chance to run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(child.state().await, ChannelState::Open);
    }

    #[tokio::test]
    async fn child_ids_never_collide_before_close() {
        let (root, _data_rx, _announce_rx, _sink_rx) = root_with_sink();
        let (first, _, _) = root.create_child(vec![]).await.unwrap();
        let (second, _, _) = root.create_child(vec![]).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn peer_announced_create_channel_advances_next_id() {
        let (root, _data_rx, mut announce_rx, _sink_rx) = root_with_sink();
        let frame = MuxFrame::new(FrameType::CreateChannel, 500, b"FSLS".to_vec());
        root.handle_inbound(frame).await.unwrap();

        let announce = announce_rx.recv().await.unwrap();
        assert_eq!(announce.channel.id, 500);
        assert_eq!(announce.init, b"FSLS");
        assert_eq!(announce.channel.state().await, ChannelState::Open);

        // A subsequent local create_child must not collide with 500.
        let (local, _, _) = root.create_child(vec![]).await.unwrap();
        assert_eq!(local.id, 501);
    }

    #[tokio::test]
    async fn close_channel_unknown_id_is_silent_noop() {
        let (root, _data_rx, _announce_rx, _sink_rx) = root_with_sink();
        let frame = MuxFrame::new(FrameType::CloseChannel, 9999, vec![]);
        assert!(root.handle_inbound(frame).await.is_ok());
    }

    #[tokio::test]
    async fn raw_data_on_root_reaches_root_data_channel() {
        let (root, mut data_rx, _announce_rx, _sink_rx) = root_with_sink();
        let frame = MuxFrame::new(FrameType::RawBinaryData, 0, vec![1, 2, 3]);
        root.handle_inbound(frame).await.unwrap();
        let received = data_rx.recv().await.unwrap();
        assert_eq!(received.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn nested_data_frame_routes_to_grandchild() {
        let (root, _data_rx, mut announce_rx, mut sink_rx) = root_with_sink();
        let frame = MuxFrame::new(FrameType::CreateChannel, 1, b"FSLS".to_vec());
        root.handle_inbound(frame).await.unwrap();
        let announce = announce_rx.recv().await.unwrap();
        let fsls_channel = announce.channel;

        // fsls_channel sends RawBinaryData on itself; should be wrapped in
        // a Data frame addressed at channel 1 when it reaches the socket.
        fsls_channel
            .send(FrameType::RawBinaryData, b"hello".to_vec())
            .await
            .unwrap();
        let raw = sink_rx.recv().await.unwrap();
        let outer = MuxFrame::decode(&raw).unwrap();
        assert_eq!(outer.frame_type, FrameType::Data);
        assert_eq!(outer.channel_id, 1);
        let inner = MuxFrame::decode(&outer.payload).unwrap();
        assert_eq!(inner.frame_type, FrameType::RawBinaryData);
        assert_eq!(inner.channel_id, 1);
        assert_eq!(inner.payload, b"hello");
    }

    #[tokio::test]
    async fn send_while_connecting_is_queued_until_open() {
        let (root, _data_rx, _announce_rx, mut sink_rx) = root_with_sink();
        let (child, _child_data_rx, _child_announce_rx) = root.create_child(vec![]).await.unwrap();
        // drain the CreateChannel frame
        let _ = sink_rx.recv().await.unwrap();

        child.send(FrameType::RawStringData, b"queued".to_vec()).await.unwrap();

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(child.state().await, ChannelState::Open);

        let raw = sink_rx.recv().await.unwrap();
        let frame = MuxFrame::decode(&raw).unwrap();
        assert_eq!(frame.frame_type, FrameType::RawStringData);
        assert_eq!(frame.payload, b"queued");
    }

    #[tokio::test]
    async fn send_after_close_errors() {
        let (root, _data_rx, _announce_rx, _sink_rx) = root_with_sink();
        let (child, _child_data_rx, _child_announce_rx) = root.create_child(vec![]).await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        child.close(1000, String::new()).await.unwrap();
        let err = child.send(FrameType::RawBinaryData, vec![1]).await;
        assert!(matches!(err, Err(GatewayError::InvalidState(_))));
    }

    #[tokio::test]
    async fn closing_parent_closes_descendants() {
        let (root, _data_rx, _announce_rx, _sink_rx) = root_with_sink();
        let (parent, _, _) = root.create_child(vec![]).await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let (grandchild, _, _) = parent.create_child(vec![]).await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        parent.close(1000, String::new()).await.unwrap();
        assert_eq!(grandchild.state().await, ChannelState::Closed);
    }
}
