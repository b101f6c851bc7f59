// src/testing.rs
//! Scripted stand-ins for the network: a gateway answering from a route table
//! and a connector whose connections are driven by hand. Used by the test-suite.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gateway::{Access, Gateway, HttpReply};
use crate::sse::{EventStream, SseEvent, StreamConnector};

#[derive(Debug, Clone)]
enum Outcome {
    Reply(HttpReply),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Route {
    outcome: Outcome,
    delay: Option<Duration>,
}

/// Gateway that answers from a URL → reply table. Unknown URLs fail.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<(String, Access)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, url: &str, outcome: Outcome) {
        let mut routes = self.routes.lock().expect("routes mutex poisoned");
        let delay = routes.get(url).and_then(|r| r.delay);
        routes.insert(url.to_string(), Route { outcome, delay });
    }

    pub fn set_json(&self, url: &str, body: Value) {
        self.set(url, Outcome::Reply(HttpReply::new(200, body.to_string())));
    }

    pub fn set_status(&self, url: &str, status: u16) {
        self.set(url, Outcome::Reply(HttpReply::new(status, "")));
    }

    pub fn set_error(&self, url: &str, message: &str) {
        self.set(url, Outcome::Fail(message.to_string()));
    }

    /// Every later call to `url` takes `delay` (tokio time) before answering.
    pub fn set_delay(&self, url: &str, delay: Duration) {
        let mut routes = self.routes.lock().expect("routes mutex poisoned");
        if let Some(r) = routes.get_mut(url) {
            r.delay = Some(delay);
        }
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    pub fn requests(&self) -> Vec<(String, Access)> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn get(&self, url: &str, access: Access) -> Result<HttpReply> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push((url.to_string(), access));
        let route = self
            .routes
            .lock()
            .expect("routes mutex poisoned")
            .get(url)
            .cloned();
        let route = route.ok_or_else(|| anyhow!("no route for {url}"))?;
        if let Some(d) = route.delay {
            tokio::time::sleep(d).await;
        }
        match route.outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Fail(msg) => Err(anyhow!(msg)),
        }
    }
}

struct Session {
    url: String,
    opened_at: Instant,
    tx: Option<mpsc::UnboundedSender<Result<SseEvent>>>,
}

/// Connector whose connections are fed by the test. Sessions are matched by
/// URL prefix, so a resume query string does not get in the way.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<Vec<Session>>,
    refusals: Mutex<HashMap<String, VecDeque<String>>>,
    attempts: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next connect to a URL starting with `prefix` fails with `message`.
    pub fn refuse_next(&self, prefix: &str, message: &str) {
        self.refusals
            .lock()
            .expect("refusals mutex poisoned")
            .entry(prefix.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    fn with_latest<R>(&self, prefix: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        sessions.iter_mut().rev().find(|s| s.url.starts_with(prefix)).map(f)
    }

    /// Push an event into the newest open connection. `false` if none is open.
    pub fn send(&self, prefix: &str, event: SseEvent) -> bool {
        self.with_latest(prefix, |s| {
            s.tx.as_ref().is_some_and(|tx| tx.send(Ok(event)).is_ok())
        })
        .unwrap_or(false)
    }

    /// Break the newest connection with a transport error.
    pub fn fail(&self, prefix: &str, message: &str) -> bool {
        self.with_latest(prefix, |s| match s.tx.take() {
            Some(tx) => tx.send(Err(anyhow!(message.to_string()))).is_ok(),
            None => false,
        })
        .unwrap_or(false)
    }

    /// Close the newest connection cleanly (server side end of stream).
    pub fn close(&self, prefix: &str) -> bool {
        self.with_latest(prefix, |s| s.tx.take().is_some()).unwrap_or(false)
    }

    /// Every connect attempt (successful or refused) with its tokio timestamp.
    pub fn attempts(&self, prefix: &str) -> Vec<(String, Instant)> {
        self.attempts
            .lock()
            .expect("attempts mutex poisoned")
            .iter()
            .filter(|(u, _)| u.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Successfully opened connections (URLs) in order.
    pub fn opened(&self, prefix: &str) -> Vec<String> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .iter()
            .filter(|s| s.url.starts_with(prefix))
            .map(|s| s.url.clone())
            .collect()
    }

    /// Whether the newest connection for `prefix` is still held by a consumer.
    pub fn is_open(&self, prefix: &str) -> bool {
        self.with_latest(prefix, |s| s.tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn opened_at(&self, prefix: &str) -> Vec<Instant> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .iter()
            .filter(|s| s.url.starts_with(prefix))
            .map(|s| s.opened_at)
            .collect()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, url: &str, _access: Access) -> Result<EventStream> {
        let now = Instant::now();
        self.attempts
            .lock()
            .expect("attempts mutex poisoned")
            .push((url.to_string(), now));

        {
            let mut refusals = self.refusals.lock().expect("refusals mutex poisoned");
            if let Some(queue) = refusals
                .iter_mut()
                .find(|(prefix, q)| url.starts_with(prefix.as_str()) && !q.is_empty())
                .map(|(_, q)| q)
            {
                if let Some(msg) = queue.pop_front() {
                    return Err(anyhow!(msg));
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .push(Session {
                url: url.to_string(),
                opened_at: now,
                tx: Some(tx),
            });
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
