use super::executor::TestExecutor;
use super::state::StepError;
use crate::parser::types::{CoordUnit, Target};
use crate::vision::VisionError;
use serde::{Deserialize, Serialize};

/// How a target's coordinates were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    FromElementLookup,
    FromVisionFallback,
    FromCoordinates,
    FromValidatedCoordinates,
}

/// Absolute pixel position plus how it was found. Never cached across steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTarget {
    pub x: i32,
    pub y: i32,
    pub provenance: Provenance,
}

impl ResolvedTarget {
    pub fn new(x: i32, y: i32, provenance: Provenance) -> Self {
        Self { x, y, provenance }
    }
}

/// Outcome of one resolution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ResolvedTarget),
    NotFound,
    /// The judge disputed author-supplied coordinates; polling does not help
    Rejected(String),
}

impl TestExecutor {
    /// Screen dimensions, queried once per test unless invalidated
    pub(super) async fn screen_size(&mut self) -> Result<(u32, u32), StepError> {
        if let Some(size) = self.context.screen_size() {
            return Ok(size);
        }
        let size = self
            .device
            .screen_size()
            .await
            .map_err(|e| StepError::device("screen_size", e))?;
        log::debug!("Screen size {}x{}", size.0, size.1);
        self.context.cache_screen_size(size);
        Ok(size)
    }

    /// Resolve `target` once against the current screen.
    ///
    /// `screenshot` is the frame the caller already holds, if any.
    pub(super) async fn resolve_once(
        &mut self,
        target: &Target,
        screenshot: Option<&[u8]>,
    ) -> Result<Resolution, StepError> {
        match (&target.text, &target.coordinates) {
            (None, None) => Err(StepError::missing_field("step has no target")),

            (None, Some(coords)) => {
                let (w, h) = self.screen_size().await?;
                let (x, y) = coords.to_pixels(w, h);
                Ok(Resolution::Found(ResolvedTarget::new(
                    x,
                    y,
                    Provenance::FromCoordinates,
                )))
            }

            (Some(text), Some(coords)) => {
                let (w, h) = self.screen_size().await?;
                let (x, y) = coords.to_pixels(w, h);

                if !self.judge.is_available() {
                    log::debug!("No vision judge; trusting coordinates for \"{}\"", text);
                    return Ok(Resolution::Found(ResolvedTarget::new(
                        x,
                        y,
                        Provenance::FromCoordinates,
                    )));
                }

                let (x_pct, y_pct) = match coords.unit {
                    CoordUnit::Percent => (coords.x.clamp(0.0, 100.0), coords.y.clamp(0.0, 100.0)),
                    CoordUnit::Pixel => (
                        x as f64 * 100.0 / w.max(1) as f64,
                        y as f64 * 100.0 / h.max(1) as f64,
                    ),
                };

                let captured;
                let image = match screenshot {
                    Some(img) => img,
                    None => {
                        captured = self
                            .capture
                            .screenshot()
                            .await
                            .map_err(|e| StepError::device("screenshot", e))?;
                        &captured
                    }
                };

                match self.judge.validate_at(image, text, x_pct, y_pct).await {
                    Ok(j) if j.pass => Ok(Resolution::Found(ResolvedTarget::new(
                        x,
                        y,
                        Provenance::FromValidatedCoordinates,
                    ))),
                    Ok(j) => Ok(Resolution::Rejected(format!(
                        "\"{}\" is not at {}: {}",
                        text, coords, j.reason
                    ))),
                    Err(e) if e.is_transient() => {
                        log::debug!("Coordinate validation deferred to next poll: {}", e);
                        Ok(Resolution::NotFound)
                    }
                    Err(e) => Ok(Resolution::Rejected(format!(
                        "could not validate \"{}\" at {}: {}",
                        text, coords, e
                    ))),
                }
            }

            (Some(text), None) => {
                match self.device.find_element_by_text(text).await {
                    Ok(Some((x, y))) => {
                        return Ok(Resolution::Found(ResolvedTarget::new(
                            x,
                            y,
                            Provenance::FromElementLookup,
                        )))
                    }
                    Ok(None) => {}
                    // A failed dump is a miss, the next poll tries again
                    Err(e) => log::debug!("Element lookup for \"{}\" failed: {:#}", text, e),
                }

                if !self.judge.is_available() {
                    return Ok(Resolution::NotFound);
                }

                let captured;
                let image = match screenshot {
                    Some(img) => img,
                    None => match self.capture.screenshot().await {
                        Ok(bytes) => {
                            captured = bytes;
                            &captured
                        }
                        Err(e) => {
                            log::debug!("No screenshot for vision fallback: {:#}", e);
                            return Ok(Resolution::NotFound);
                        }
                    },
                };

                let (w, h) = self.screen_size().await?;
                match self.judge.locate(image, text, w, h).await {
                    Ok(Some((x, y))) => {
                        log::debug!("\"{}\" located visually at ({}, {})", text, x, y);
                        Ok(Resolution::Found(ResolvedTarget::new(
                            x,
                            y,
                            Provenance::FromVisionFallback,
                        )))
                    }
                    Ok(None) => Ok(Resolution::NotFound),
                    Err(e) => {
                        log_vision_miss(text, &e);
                        Ok(Resolution::NotFound)
                    }
                }
            }
        }
    }
}

fn log_vision_miss(text: &str, err: &VisionError) {
    if err.is_transient() {
        log::debug!("Vision locate for \"{}\" failed: {}", text, err);
    } else {
        log::warn!("Vision locate for \"{}\" failed: {}", text, err);
    }
}
