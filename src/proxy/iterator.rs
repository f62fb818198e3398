//! Client-side cursor walking the whole index (or a box of it) host by host
//! in zone order, pulling fixed-size pages per host.
//!
//! The host's batch answer carries an iterator token: a non-empty token means
//! "more data here, present the token on the next fetch"; an empty token
//! means the host is exhausted and the cursor advances to the mapping's
//! successor host with a fresh scan. Iteration is done once there is no
//! successor and the buffer ran dry.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::mapping::zorder::ZOrderMapping;
use crate::mapping::{Key, KeyMapping};
use crate::operation::{IndexEntry, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    HasData,
    Done,
}

pub struct BatchIterator {
    dispatcher: Arc<dyn Dispatcher>,
    /// The snapshot this cursor was created with; a mapping installed later
    /// does not redirect an iteration already under way
    mapping: Arc<ZOrderMapping>,
    batch_size: usize,
    range: Option<(Key, Key)>,
    current_host: Option<String>,
    token: String,
    buffer: Vec<IndexEntry>,
    position: usize,
    state: State,
}

impl BatchIterator {
    pub(crate) fn new(
        dispatcher: Arc<dyn Dispatcher>,
        mapping: Arc<ZOrderMapping>,
        batch_size: usize,
        range: Option<(Key, Key)>,
    ) -> Result<Self> {
        let current_host = mapping.first()?;
        Ok(Self {
            dispatcher,
            mapping,
            batch_size,
            range,
            current_host,
            token: String::new(),
            buffer: Vec::new(),
            position: 0,
            state: State::Init,
        })
    }

    /// True if another entry is available, fetching the next page only when
    /// the buffered one is exhausted
    pub async fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.state == State::Done {
                return Ok(false);
            }
            if self.position < self.buffer.len() {
                self.state = State::HasData;
                return Ok(true);
            }

            let host = match self.current_host.clone() {
                Some(host) => host,
                None => {
                    self.finish();
                    return Ok(false);
                }
            };
            self.fetch(&host).await?;
        }
    }

    /// The next entry. Driving the cursor past its end is a programming
    /// error and fails loudly.
    pub async fn next(&mut self) -> Result<IndexEntry> {
        if !self.has_next().await? {
            return Err(Error::Exhausted);
        }
        let entry = self.buffer[self.position].clone();
        self.position += 1;
        Ok(entry)
    }

    /// Ends the iteration early, dropping buffered entries
    pub fn close(&mut self) {
        self.finish();
    }

    async fn fetch(&mut self, host: &str) -> Result<()> {
        let request = Request::GetBatch {
            iterator: self.token.clone(),
            size: self.batch_size,
            range: self.range.clone(),
        };
        let response = self.dispatcher.send(host, request).await?;
        match response {
            Response::Batch { entries, iterator } => {
                if iterator.is_empty() {
                    // host exhausted, move on in zone order
                    self.current_host = self.mapping.successor(host)?;
                    self.token = String::new();
                } else {
                    self.token = iterator;
                }
                self.buffer = entries;
                self.position = 0;
                Ok(())
            }
            other => match other.failure_reason() {
                Some(reason) => Err(Error::Remote {
                    host: host.to_string(),
                    reason: reason.to_string(),
                }),
                None => Err(Error::UnexpectedResponse {
                    host: host.to_string(),
                    reason: format!("{:?}", other),
                }),
            },
        }
    }

    fn finish(&mut self) {
        self.state = State::Done;
        self.buffer.clear();
        self.position = 0;
    }
}
