// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process event bus with MQTT-shaped topics.
//!
//! Publishers never block: events go through unbounded channels and dead
//! subscribers are dropped on the next publish. A topic published with
//! `retain` keeps its last payload, which is replayed to new subscribers —
//! the same contract an external MQTT bridge would relay.

use base::{FastHashMap, Mutex};
use std::sync::{mpsc, Arc};

pub const TOPIC_STORAGE_PRESSURE: &str = "storage/pressure";
pub const TOPIC_STORAGE_CLEANUP: &str = "storage/cleanup";

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

struct Subscriber {
    topic: String,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    retained: Mutex<FastHashMap<String, serde_json::Value>>,
}

#[derive(Clone, Default)]
pub struct Bus(Arc<Inner>);

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a topic (`"#"` for everything). If the topic has a
    /// retained payload, it is delivered first.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        if topic != "#" {
            if let Some(payload) = self.0.retained.lock().get(topic) {
                let _ = tx.send(Event {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                });
            }
        }
        self.0.subscribers.lock().push(Subscriber {
            topic: topic.to_owned(),
            tx,
        });
        rx
    }

    pub fn publish(&self, topic: &str, payload: serde_json::Value, retain: bool) {
        if retain {
            self.0
                .retained
                .lock()
                .insert(topic.to_owned(), payload.clone());
        }
        let mut l = self.0.subscribers.lock();
        l.retain(|s| {
            if s.topic != "#" && s.topic != topic {
                return true;
            }
            s.tx.send(Event {
                topic: topic.to_owned(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delivers_to_matching_subscribers() {
        let bus = Bus::new();
        let pressure = bus.subscribe(TOPIC_STORAGE_PRESSURE);
        let all = bus.subscribe("#");
        let other = bus.subscribe(TOPIC_STORAGE_CLEANUP);

        bus.publish(TOPIC_STORAGE_PRESSURE, json!({"current": "elevated"}), false);
        assert_eq!(pressure.try_recv().unwrap().payload["current"], "elevated");
        assert_eq!(all.try_recv().unwrap().topic, TOPIC_STORAGE_PRESSURE);
        other.try_recv().unwrap_err();
    }

    #[test]
    fn retained_replayed_to_new_subscribers() {
        let bus = Bus::new();
        bus.publish(TOPIC_STORAGE_PRESSURE, json!({"current": "critical"}), true);
        bus.publish(TOPIC_STORAGE_CLEANUP, json!({"deleted": 3}), false);

        let rx = bus.subscribe(TOPIC_STORAGE_PRESSURE);
        assert_eq!(rx.try_recv().unwrap().payload["current"], "critical");

        // Non-retained topics replay nothing.
        let rx = bus.subscribe(TOPIC_STORAGE_CLEANUP);
        rx.try_recv().unwrap_err();
    }

    #[test]
    fn retained_keeps_latest_only() {
        let bus = Bus::new();
        bus.publish(TOPIC_STORAGE_PRESSURE, json!({"current": "elevated"}), true);
        bus.publish(TOPIC_STORAGE_PRESSURE, json!({"current": "normal"}), true);
        let rx = bus.subscribe(TOPIC_STORAGE_PRESSURE);
        assert_eq!(rx.try_recv().unwrap().payload["current"], "normal");
        rx.try_recv().unwrap_err();
    }

    #[test]
    fn dead_subscribers_pruned() {
        let bus = Bus::new();
        drop(bus.subscribe(TOPIC_STORAGE_PRESSURE));
        let live = bus.subscribe(TOPIC_STORAGE_PRESSURE);
        bus.publish(TOPIC_STORAGE_PRESSURE, json!(1), false);
        bus.publish(TOPIC_STORAGE_PRESSURE, json!(2), false);
        assert_eq!(live.try_recv().unwrap().payload, json!(1));
        assert_eq!(live.try_recv().unwrap().payload, json!(2));
    }
}
