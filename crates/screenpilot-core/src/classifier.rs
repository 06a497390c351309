//! Screen classification.
//!
//! One screenshot, every registered screen marker scored, best score wins.
//! A best score under the acceptance threshold yields `Unknown`, carrying the
//! score for diagnostics.

use std::sync::Arc;

use tracing::trace;

use crate::device::DeviceId;
use crate::error::TransportError;
use crate::screen::{Screen, ScreenIdentity, ScreenMarkers};
use crate::vision::{DeviceIo, Screenshot, Vision};

/// Full result of one classification pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Accepted identity (`Unknown` when nothing cleared the threshold).
    pub identity: ScreenIdentity,
    /// Highest-scoring candidate regardless of threshold.
    pub best: Option<ScreenIdentity>,
}

pub struct Classifier {
    vision: Arc<Vision>,
    markers: Arc<ScreenMarkers>,
    accept_threshold: f64,
}

impl Classifier {
    #[must_use]
    pub fn new(vision: Arc<Vision>, markers: ScreenMarkers, accept_threshold: f64) -> Self {
        Self {
            vision,
            markers: Arc::new(markers),
            accept_threshold,
        }
    }

    #[must_use]
    pub fn accept_threshold(&self) -> f64 {
        self.accept_threshold
    }

    /// Identify the device's current screen.
    pub async fn classify(&self, device: &DeviceId) -> Result<ScreenIdentity, TransportError> {
        Ok(self.classify_full(device).await?.identity)
    }

    /// One screenshot and every marker scored, in a single blocking-pool hop.
    pub async fn classify_full(&self, device: &DeviceId) -> Result<Classification, TransportError> {
        let owned = device.clone();
        let markers = Arc::clone(&self.markers);
        let threshold = self.accept_threshold;
        self.vision
            .run(device, "classify", move |io| {
                let image = io.screenshot(&owned)?;
                score(io, &markers, threshold, &image)
            })
            .await
    }

    pub async fn classify_image(&self, image: &Screenshot) -> Result<Classification, TransportError> {
        let image = image.clone();
        let markers = Arc::clone(&self.markers);
        let threshold = self.accept_threshold;
        let device = image.device.clone();
        self.vision
            .run(&device, "classify", move |io| score(io, &markers, threshold, &image))
            .await
    }

    /// Convenience check used by wait conditions. Transport errors count as "no".
    pub async fn is_on(&self, device: &DeviceId, screen: Screen) -> bool {
        matches!(self.classify(device).await, Ok(identity) if identity.screen == screen)
    }
}

fn score(
    io: &DeviceIo,
    markers: &ScreenMarkers,
    accept_threshold: f64,
    image: &Screenshot,
) -> Result<Classification, TransportError> {
    let mut best: Option<ScreenIdentity> = None;
    for (screen, marker) in markers.iter() {
        let result = io.locate(image, marker)?;
        trace!(
            device = %image.device,
            marker = %marker.name,
            confidence = result.confidence,
            "Screen marker score"
        );
        if best.is_none_or(|b| result.confidence > b.confidence) {
            best = Some(ScreenIdentity::new(*screen, result.confidence));
        }
    }

    let identity = match best {
        Some(candidate) if candidate.confidence >= accept_threshold => candidate,
        Some(candidate) => ScreenIdentity::unknown(candidate.confidence),
        None => ScreenIdentity::unknown(0.0),
    };
    Ok(Classification { identity, best })
}
