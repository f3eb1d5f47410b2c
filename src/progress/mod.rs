//! 进度事件通道 - 控制器与观察者之间的异步有序队列

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{EventKind, ResearchEvent};

/// 事件发送端
///
/// 可以被克隆到批处理的并发子任务中，所有克隆共享同一个有序队列
#[derive(Clone, Debug)]
pub struct ProgressSink {
    sender: UnboundedSender<ResearchEvent>,
}

/// 事件接收端，由观察者按自己的节奏消费
#[derive(Debug)]
pub struct EventStream {
    receiver: UnboundedReceiver<ResearchEvent>,
}

impl ProgressSink {
    /// 创建一对相连的发送端与接收端
    pub fn channel() -> (ProgressSink, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ProgressSink { sender }, EventStream { receiver })
    }

    /// 发送一个事件，接收端已关闭时事件被丢弃
    pub fn emit(&self, event: EventKind) {
        let event = ResearchEvent::now(event);
        if let Err(e) = self.sender.send(event) {
            debug!(kind = e.0.kind_name(), "观察者已断开，丢弃事件");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl EventStream {
    /// 获取下一个事件，所有发送端释放后返回None
    pub async fn next(&mut self) -> Option<ResearchEvent> {
        self.receiver.recv().await
    }

    /// 不等待地取出当前已到达的全部事件
    pub fn drain_ready(&mut self) -> Vec<ResearchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// 在独立任务中把事件逐个交给回调，直到所有发送端释放
    pub fn spawn_observer<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ResearchEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.next().await {
                callback(event);
            }
        })
    }

    /// 收集全部事件，直到所有发送端释放
    pub async fn collect(mut self) -> Vec<ResearchEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasoning(text: &str) -> EventKind {
        EventKind::Reasoning {
            action: "test".to_string(),
            reasoning: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (sink, stream) = ProgressSink::channel();
        for i in 0..10 {
            sink.emit(reasoning(&i.to_string()));
        }
        drop(sink);

        let events = stream.collect().await;
        let texts: Vec<String> = events
            .into_iter()
            .map(|e| match e.event {
                EventKind::Reasoning { reasoning, .. } => reasoning,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_concurrent_emitters_deliver_every_event_once() {
        let (sink, stream) = ProgressSink::channel();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.emit(reasoning(&i.to_string())) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        drop(sink);

        let mut texts: Vec<String> = stream
            .collect()
            .await
            .into_iter()
            .filter_map(|e| match e.event {
                EventKind::Reasoning { reasoning, .. } => Some(reasoning),
                _ => None,
            })
            .collect();
        texts.sort();
        assert_eq!(texts.len(), 8);
        texts.dedup();
        assert_eq!(texts.len(), 8);
    }

    #[tokio::test]
    async fn test_emit_after_observer_dropped_does_not_panic() {
        let (sink, stream) = ProgressSink::channel();
        drop(stream);
        assert!(sink.is_closed());
        sink.emit(reasoning("ignored"));
    }

    #[tokio::test]
    async fn test_spawn_observer_drains_until_senders_drop() {
        let (sink, stream) = ProgressSink::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = stream.spawn_observer(move |event| {
            let _ = tx.send(event.kind_name());
        });

        sink.emit(reasoning("a"));
        sink.emit(EventKind::GenerateEssayStart {
            goal: "g".to_string(),
        });
        drop(sink);
        handle.await.unwrap();

        assert_eq!(rx.recv().await, Some("reasoning"));
        assert_eq!(rx.recv().await, Some("generate_essay_start"));
        assert_eq!(rx.recv().await, None);
    }
}
