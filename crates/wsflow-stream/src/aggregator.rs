//! Many channel × pair streams merged into one output pipe.
//!
//! ```text
//! StreamConnection ─► normalize ─► audit ─► [extra] ─► decode ─┐
//! StreamConnection ─► normalize ─► audit ─► [extra] ─► decode ─┼─► collector ─► output
//! ...                                                          ┘
//! ```
//!
//! Every arrow is a [`Pipe`]; every box after the connection is a
//! [`PipelineStage`]. Stream operations are partial-success: a stream that
//! fails to open or subscribe is closed and removed while the others carry
//! on, and its collector input is stopped so the output still terminates.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use wsflow_core::pipe::Pipe;
use wsflow_core::types::{StreamKey, StreamState};
use wsflow_core::ws::WsMessage;

use crate::connection::{StreamCollaborators, StreamConnection, StreamSettings};
use crate::handler::Handler;
use crate::normalize::timestamp_normalizer;
use crate::sequence::SequenceAuditor;
use crate::stage::PipelineStage;

/// A task started by [`MultiStreamAggregator::start_stream`].
enum Startable<'a> {
    Stage(&'a PipelineStage),
    Receiver(&'a StreamConnection),
}

impl Startable<'_> {
    fn label(&self) -> &str {
        match self {
            Self::Stage(stage) => stage.label(),
            Self::Receiver(stream) => stream.task_label(),
        }
    }

    fn start(&self) -> bool {
        match self {
            Self::Stage(stage) => stage.start(),
            Self::Receiver(stream) => stream.start_task(),
        }
    }
}

/// Per-stream stages plus the pipe feeding the collector.
struct StreamChain<Out> {
    stages: Vec<PipelineStage>,
    collector_input: Pipe<Out>,
}

pub struct MultiStreamAggregator<Out> {
    label: String,
    streams: BTreeMap<StreamKey, StreamConnection>,
    chains: BTreeMap<StreamKey, StreamChain<Out>>,
    auditor: Arc<Mutex<SequenceAuditor>>,
    collector: PipelineStage,
    output: Pipe<Out>,
}

impl<Out> std::fmt::Debug for MultiStreamAggregator<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiStreamAggregator")
            .field("label", &self.label)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Out: Send + 'static> MultiStreamAggregator<Out> {
    /// One stream per `channel × pair`, each decoded by `decoder`.
    pub fn new(
        label: impl Into<String>,
        settings: StreamSettings,
        channels: &[String],
        pairs: &[String],
        collaborators: StreamCollaborators,
        decoder: Handler<Value, Out>,
    ) -> Self {
        Self::with_preprocessors(label, settings, channels, pairs, collaborators, Vec::new(), decoder)
    }

    /// Like [`new`](Self::new), with `preprocessors` run in order between the
    /// sequence audit and the decoder.
    pub fn with_preprocessors(
        label: impl Into<String>,
        settings: StreamSettings,
        channels: &[String],
        pairs: &[String],
        collaborators: StreamCollaborators,
        preprocessors: Vec<Handler<WsMessage, WsMessage>>,
        decoder: Handler<Value, Out>,
    ) -> Self {
        let label = label.into();
        let capacity = settings.pipe_capacity;
        let auditor = Arc::new(Mutex::new(SequenceAuditor::new()));
        let mut streams = BTreeMap::new();
        let mut chains = BTreeMap::new();

        for channel in channels {
            for pair in pairs {
                let stream = StreamConnection::new(
                    channel.clone(),
                    pair.clone(),
                    settings.clone(),
                    collaborators.clone(),
                );
                let key = stream.key().clone();
                // A resubscribed channel restarts its sequence numbers.
                let reset = Arc::clone(&auditor);
                stream.on_subscribed(Arc::new(move |key: &StreamKey| reset.lock().reset(key)));

                let mut handlers = vec![
                    ("normalize".to_string(), timestamp_normalizer()),
                    ("audit".to_string(), SequenceAuditor::handler(Arc::clone(&auditor), key.clone())),
                ];
                handlers.extend(
                    preprocessors
                        .iter()
                        .enumerate()
                        .map(|(i, h)| (format!("pre{i}"), h.clone())),
                );

                let mut stages = Vec::with_capacity(handlers.len() + 1);
                let mut upstream = stream.pipe();
                for (name, handler) in handlers {
                    let downstream = Pipe::new(capacity);
                    stages.push(PipelineStage::pipe_to_pipe(
                        format!("{label}:{key}:{name}"),
                        upstream,
                        handler,
                        downstream.clone(),
                    ));
                    upstream = downstream;
                }
                let collector_input = Pipe::new(capacity);
                stages.push(PipelineStage::pipe_to_pipe(
                    format!("{label}:{key}:decode"),
                    upstream,
                    decoder.clone(),
                    collector_input.clone(),
                ));

                chains.insert(key.clone(), StreamChain { stages, collector_input });
                streams.insert(key, stream);
            }
        }

        let output = Pipe::new(capacity);
        let collector = PipelineStage::collector(
            format!("{label}:collector"),
            chains.values().map(|c| c.collector_input.clone()).collect(),
            Handler::identity(),
            output.clone(),
        );

        info!("[{label}] aggregating {} stream(s)", streams.len());
        Self { label, streams, chains, auditor, collector, output }
    }

    pub fn output(&self) -> Pipe<Out> {
        self.output.clone()
    }

    pub fn stream_keys(&self) -> Vec<StreamKey> {
        self.streams.keys().cloned().collect()
    }

    pub fn stream(&self, key: &StreamKey) -> Option<&StreamConnection> {
        self.streams.get(key)
    }

    pub fn sequence_auditor(&self) -> Arc<Mutex<SequenceAuditor>> {
        Arc::clone(&self.auditor)
    }

    /// Open every stream. Returns the keys of the streams that failed and
    /// were removed.
    pub async fn open(&mut self) -> Vec<StreamKey> {
        join_all(self.streams.values().map(|s| s.open_connection())).await;
        self.retain_streams("open", StreamState::Opened).await
    }

    /// Subscribe every stream (opening closed ones first).
    pub async fn subscribe(&mut self) -> Vec<StreamKey> {
        join_all(self.streams.values().map(|s| s.subscribe(None))).await;
        self.retain_streams("subscribe", StreamState::Subscribed).await
    }

    pub async fn unsubscribe(&mut self) -> Vec<StreamKey> {
        join_all(self.streams.values().map(|s| s.unsubscribe(None))).await;
        self.retain_streams("unsubscribe", StreamState::Unsubscribed).await
    }

    /// Start the collector, then per stream the stages from the decoder back
    /// to the normalizer, then the receiving task.
    pub fn start_stream(&self) {
        for task in self.start_sequence() {
            if !task.start() {
                debug!("[{}] {} already running", self.label, task.label());
            }
        }
        info!("[{}] started {} stream(s)", self.label, self.streams.len());
    }

    /// Consumers before producers, so nothing is written to a pipe whose
    /// reader is not running yet.
    fn start_sequence(&self) -> Vec<Startable<'_>> {
        let mut sequence = vec![Startable::Stage(&self.collector)];
        for (key, stream) in &self.streams {
            if let Some(chain) = self.chains.get(key) {
                sequence.extend(chain.stages.iter().rev().map(Startable::Stage));
            }
            sequence.push(Startable::Receiver(stream));
        }
        sequence
    }

    /// Close every connection, then stop receiving tasks, stages and the
    /// collector. Buffered messages are flushed into the output before it is
    /// stopped.
    pub async fn stop_stream(&self) {
        join_all(self.streams.values().map(|s| s.close_connection())).await;
        for stream in self.streams.values() {
            stream.stop_task().await;
        }
        for chain in self.chains.values() {
            for stage in &chain.stages {
                stage.stop().await;
            }
        }
        self.collector.stop().await;
        info!("[{}] stopped", self.label);
    }

    async fn retain_streams(&mut self, operation: &str, expected: StreamState) -> Vec<StreamKey> {
        let failed: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, s)| s.state() != expected)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &failed {
            warn!("[{}] {operation} failed for {key}, removing stream", self.label);
            if let Some(stream) = self.streams.remove(key) {
                stream.close_connection().await;
                stream.stop_task().await;
            }
            if let Some(chain) = self.chains.remove(key) {
                for stage in &chain.stages {
                    stage.stop().await;
                }
                chain.collector_input.stop();
            }
        }

        if self.streams.is_empty() {
            error!("[{}] no stream left after {operation}", self.label);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{StreamRecord, record_decoder};
    use crate::subscription::separator_symbol_to_pair;
    use crate::test_support::{MockTransport, collaborators};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::sequence::SequenceCheck;
    use wsflow_core::error::FlowError;
    use wsflow_core::pipe::Item;
    use wsflow_core::types::StreamAction;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> StreamSettings {
        StreamSettings {
            ws_url: "wss://example.test/ws".into(),
            reconnect_interval: Duration::from_millis(10),
            pipe_capacity: 100,
            ..StreamSettings::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn passthrough(mock: &Arc<MockTransport>, channels: &[&str], pairs: &[&str]) -> MultiStreamAggregator<Value> {
        MultiStreamAggregator::new(
            "test",
            settings(),
            &strings(channels),
            &strings(pairs),
            collaborators(mock),
            Handler::identity(),
        )
    }

    #[test]
    fn builds_one_stream_per_channel_and_pair() {
        let mock = MockTransport::new();
        let agg = passthrough(&mock, &["user", "market_trades"], &["BTC-USD", "ETH-USD"]);
        let keys = agg.stream_keys();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], StreamKey::new("market_trades", "BTC-USD"));
        assert!(agg.stream(&StreamKey::new("user", "ETH-USD")).is_some());
        assert!(agg.stream(&StreamKey::new("level2", "ETH-USD")).is_none());
    }

    #[tokio::test]
    async fn messages_flow_through_to_output_and_end_on_stop() {
        let mock = MockTransport::new();
        let mut agg = passthrough(&mock, &["user"], &["BTC-USD"]);
        assert!(agg.subscribe().await.is_empty());
        agg.start_stream();

        mock.push(json!({"channel": "user", "sequence_num": 1, "timestamp": "2023-02-09T20:33:57Z"}));
        let output = agg.output();
        let Item::Value(msg) = timeout(WAIT, output.get()).await.unwrap() else {
            panic!("output ended early");
        };
        assert_eq!(msg["timestamp"].as_f64(), Some(1_675_974_837.0));
        assert_eq!(msg["sequence_num"], 1);

        agg.stop_stream().await;
        assert_eq!(timeout(WAIT, output.get()).await.unwrap(), Item::EndOfStream);
        assert_eq!(mock.sent_actions(StreamAction::Unsubscribe).len(), 1);
        let key = StreamKey::new("user", "BTC-USD");
        assert_eq!(agg.sequence_auditor().lock().last_seq(&key), Some(1));
    }

    #[tokio::test]
    async fn decoded_records_reach_output() {
        let mock = MockTransport::new();
        let mut agg = MultiStreamAggregator::new(
            "decoded",
            settings(),
            &strings(&["market_trades"]),
            &strings(&["ETH-USD"]),
            collaborators(&mock),
            record_decoder(separator_symbol_to_pair("-")),
        );
        agg.subscribe().await;
        agg.start_stream();

        mock.push(json!({"channel": "heartbeats", "events": []}));
        mock.push(json!({
            "channel": "market_trades",
            "timestamp": "2023-02-09T20:33:57Z",
            "events": [{"trades": [{"trade_id": "9", "product_id": "ETH-USD",
                                    "price": "1500", "size": "2", "side": "SELL"}]}]
        }));

        let output = agg.output();
        let Item::Value(StreamRecord::Trade(trade)) = timeout(WAIT, output.get()).await.unwrap() else {
            panic!("expected a trade");
        };
        assert_eq!(trade.trade_id, "9");
        assert!(!trade.is_buy);
        agg.stop_stream().await;
    }

    #[tokio::test]
    async fn failing_streams_are_removed_and_output_still_ends() {
        let mock = MockTransport::new();
        let mut agg = passthrough(&mock, &["user"], &["BTC-USD", "ETH-USD"]);
        // The first stream to connect fails; the other one succeeds.
        mock.fail_next_connects(1);
        let failed = agg.open().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(agg.stream_keys().len(), 1);

        assert!(agg.subscribe().await.is_empty());
        agg.start_stream();
        agg.stop_stream().await;
        let output = agg.output();
        assert_eq!(timeout(WAIT, output.get()).await.unwrap(), Item::EndOfStream);
    }

    #[tokio::test]
    async fn extra_preprocessors_run_before_decoding() {
        let mock = MockTransport::new();
        let tag = Handler::transform(|mut msg: Value| {
            msg["tagged"] = json!(true);
            Ok(msg)
        });
        let mut agg = MultiStreamAggregator::with_preprocessors(
            "pre",
            settings(),
            &strings(&["user"]),
            &strings(&["BTC-USD"]),
            collaborators(&mock),
            vec![tag],
            Handler::identity(),
        );
        agg.subscribe().await;
        agg.start_stream();
        mock.push(json!({"channel": "user"}));

        let output = agg.output();
        let Item::Value(msg) = timeout(WAIT, output.get()).await.unwrap() else {
            panic!("output ended early");
        };
        assert_eq!(msg["tagged"], true);
        agg.stop_stream().await;
    }

    #[test]
    fn start_order_runs_from_collector_back_to_receiver() {
        let mock = MockTransport::new();
        let agg = passthrough(&mock, &["user"], &["BTC-USD"]);
        let order: Vec<String> = agg.start_sequence().iter().map(|t| t.label().to_string()).collect();
        assert_eq!(
            order,
            vec![
                "test:collector",
                "test:user:BTC-USD:decode",
                "test:user:BTC-USD:audit",
                "test:user:BTC-USD:normalize",
                "user:BTC-USD:recv",
            ]
        );
    }

    #[tokio::test]
    async fn start_stream_runs_every_task() {
        let mock = MockTransport::new();
        let mut agg = passthrough(&mock, &["user", "market_trades"], &["BTC-USD"]);
        agg.subscribe().await;
        agg.start_stream();
        assert!(agg.collector.is_running());
        for chain in agg.chains.values() {
            assert!(chain.stages.iter().all(PipelineStage::is_running));
        }
        for stream in agg.streams.values() {
            assert_eq!(stream.task_state(), wsflow_core::types::TaskState::Started);
        }
        agg.stop_stream().await;
        assert!(!agg.collector.is_running());
    }

    #[tokio::test]
    async fn sequence_audit_restarts_after_reconnect() {
        let mock = MockTransport::new();
        let mut agg = passthrough(&mock, &["user"], &["BTC-USD"]);
        agg.subscribe().await;
        agg.start_stream();
        let output = agg.output();
        let key = StreamKey::new("user", "BTC-USD");

        mock.push(json!({"channel": "user", "sequence_num": 10}));
        assert!(matches!(timeout(WAIT, output.get()).await.unwrap(), Item::Value(_)));
        assert_eq!(agg.sequence_auditor().lock().last_seq(&key), Some(10));

        // The new connection numbers its messages from zero.
        mock.push_error(FlowError::Connection("reset by peer".into()));
        for seq in [0, 1, 3] {
            mock.push(json!({"channel": "user", "sequence_num": seq}));
        }
        for _ in 0..3 {
            assert!(matches!(timeout(WAIT, output.get()).await.unwrap(), Item::Value(_)));
        }

        let auditor = agg.sequence_auditor();
        assert_eq!(auditor.lock().last_seq(&key), Some(3));
        assert_eq!(
            auditor.lock().check(&key, 6),
            SequenceCheck::Gap { expected: 4, received: 6 }
        );
        agg.stop_stream().await;
    }

    #[tokio::test]
    async fn unsubscribe_moves_every_stream_to_unsubscribed() {
        let mock = MockTransport::new();
        let mut agg = passthrough(&mock, &["user", "market_trades"], &["BTC-USD"]);
        agg.subscribe().await;
        assert!(agg.unsubscribe().await.is_empty());
        for key in agg.stream_keys() {
            assert_eq!(agg.stream(&key).unwrap().state(), StreamState::Unsubscribed);
        }
        assert_eq!(mock.sent_actions(StreamAction::Unsubscribe).len(), 2);
        agg.stop_stream().await;
    }
}
