//! Client-facing adapters.
//!
//! [`IngressAdapter`] decodes frames arriving on this member's client-facing
//! endpoint. [`EgressSender`] delivers session events back to clients on
//! their response channels, creating publications lazily and caching them
//! per `(channel, stream)`.

use std::collections::HashMap;

use tektite_transport::{Media, Offer, Publication, Subscription};
use tektite_wire::{EgressEvent, IngressFrame};

use crate::error::ClusterResult;

// ============================================================================
// Ingress Adapter
// ============================================================================

/// Decoder of client ingress frames.
pub struct IngressAdapter {
    subscription: Box<dyn Subscription>,
}

impl IngressAdapter {
    pub fn new(subscription: Box<dyn Subscription>) -> Self {
        Self { subscription }
    }

    /// Polls up to `limit` ingress frames, in order.
    pub fn poll(&mut self, limit: usize) -> ClusterResult<Vec<IngressFrame>> {
        let fragments = self.subscription.poll(limit);
        let mut frames = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            frames.push(tektite_wire::decode(&fragment.payload)?);
        }
        Ok(frames)
    }

    pub fn close(&mut self) {
        self.subscription.close();
    }
}

// ============================================================================
// Egress Sender
// ============================================================================

/// Sends egress events to clients on their response channels.
#[derive(Default)]
pub struct EgressSender {
    publications: HashMap<(String, i32), Box<dyn Publication>>,
}

impl EgressSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers one event; false means back-pressure, retry later.
    pub fn offer(
        &mut self,
        media: &mut dyn Media,
        response_channel: &str,
        response_stream_id: i32,
        event: &EgressEvent,
    ) -> ClusterResult<bool> {
        let key = (response_channel.to_string(), response_stream_id);
        if !self.publications.contains_key(&key) {
            let publication = media.add_publication(response_channel, response_stream_id)?;
            self.publications.insert(key.clone(), publication);
        }
        let publication = self.publications.get_mut(&key).expect("inserted above");

        let bytes = tektite_wire::encode(event)?;
        match publication.offer(&bytes) {
            Offer::Position(_) => Ok(true),
            Offer::BackPressured | Offer::NotConnected => Ok(false),
            Offer::Closed => Ok(false),
        }
    }

    /// Drops the cached publication for a response channel.
    pub fn release(&mut self, response_channel: &str, response_stream_id: i32) {
        if let Some(mut publication) = self
            .publications
            .remove(&(response_channel.to_string(), response_stream_id))
        {
            publication.close();
        }
    }

    pub fn close(&mut self) {
        for (_, mut publication) in self.publications.drain() {
            publication.close();
        }
    }
}
