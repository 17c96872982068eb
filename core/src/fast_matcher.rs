//! Non-blocking single-shot matching
//!
//! [`FastMatcherThread`] runs at most one best-match search at a time on a background thread.
//! The driver submits work with [`FastMatcherThread::match_async`], which is a no-op while a job
//! is in flight (the frame is dropped, nothing is queued), polls with
//! [`FastMatcherThread::is_running`] and collects the result exactly once with
//! [`FastMatcherThread::result_if_available`]. Jobs are never cancelled; a job whose result is
//! never collected simply runs to completion.
//!
//! Both images are copied into the job so the caller may reuse its buffers immediately. Errors
//! and panics inside the job are reported when the result is collected.
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Result, anyhow};
use image::GrayImage;
use image::imageops::{self, FilterType};
use log::{debug, error};
use nalgebra::Point2;

use crate::matching::AffineMatcher;

/// Images are shrunk by this factor before the search.
pub const SCALE_DOWN_FACTOR: f64 = 0.5;
/// Half-width (radians) of the rotation window searched around the heading.
pub const DIRECTION_PRECISION: f64 = std::f64::consts::FRAC_PI_4;

pub struct FastMatcherThread {
    matcher: Arc<dyn AffineMatcher>,
    direction_precision: f64,
    scale_down_factor: f64,
    job: Option<JoinHandle<Result<Point2<f64>>>>,
}

impl FastMatcherThread {
    pub fn new(matcher: Arc<dyn AffineMatcher>) -> Self {
        FastMatcherThread {
            matcher,
            direction_precision: DIRECTION_PRECISION,
            scale_down_factor: SCALE_DOWN_FACTOR,
            job: None,
        }
    }

    pub fn set_direction_precision(&mut self, precision: f64) {
        self.direction_precision = precision;
    }

    pub fn set_scale_down_factor(&mut self, factor: f64) {
        self.scale_down_factor = factor;
    }

    /// Runs the search on the calling thread.
    ///
    /// # Returns
    /// The centre of the best match in full-resolution image coordinates.
    pub fn match_blocking(
        &self,
        image: &GrayImage,
        template: &GrayImage,
        direction: f64,
    ) -> Result<Point2<f64>> {
        locate(
            self.matcher.as_ref(),
            image,
            template,
            direction,
            self.direction_precision,
            self.scale_down_factor,
        )
    }

    /// Starts a background search unless one is still running.
    ///
    /// A finished job whose result was not collected is discarded.
    ///
    /// # Returns
    /// `true` when a job was launched.
    pub fn match_async(&mut self, image: &GrayImage, template: &GrayImage, direction: f64) -> bool {
        if self.is_running() {
            return false;
        }
        let matcher = Arc::clone(&self.matcher);
        let image = image.clone();
        let template = template.clone();
        let precision = self.direction_precision;
        let scale = self.scale_down_factor;
        let spawned = thread::Builder::new()
            .name("fast-matcher".to_string())
            .spawn(move || locate(matcher.as_ref(), &image, &template, direction, precision, scale));
        match spawned {
            Ok(handle) => {
                self.job = Some(handle);
                true
            }
            Err(e) => {
                error!("could not start the fast matcher thread: {}", e);
                self.job = None;
                false
            }
        }
    }

    /// `true` while a launched job has not finished.
    pub fn is_running(&self) -> bool {
        self.job.as_ref().is_some_and(|job| !job.is_finished())
    }

    /// Takes the result of a finished job, at most once per job. Never blocks.
    pub fn result_if_available(&mut self) -> Option<Result<Point2<f64>>> {
        if !self.job.as_ref().is_some_and(|job| job.is_finished()) {
            return None;
        }
        let job = self.job.take()?;
        Some(match job.join() {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("fast matcher job panicked: {}", panic_message(panic.as_ref()))),
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn shrink(image: &GrayImage, factor: f64) -> GrayImage {
    let width = ((image.width() as f64 * factor).round() as u32).max(1);
    let height = ((image.height() as f64 * factor).round() as u32).max(1);
    imageops::resize(image, width, height, FilterType::Triangle)
}

fn locate(
    matcher: &dyn AffineMatcher,
    image: &GrayImage,
    template: &GrayImage,
    direction: f64,
    precision: f64,
    scale: f64,
) -> Result<Point2<f64>> {
    let start = Instant::now();
    let small_image = shrink(image, scale);
    let small_template = shrink(template, scale);
    let outcome = matcher.apply(
        &small_image,
        &small_template,
        direction - precision,
        direction + precision,
    )?;
    let center = outcome.center();
    debug!(
        "fast match distance {:.4} in {:.1?}",
        outcome.distance,
        start.elapsed()
    );
    Ok(Point2::new(center.x / scale, center.y / scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AffineMatrix;
    use crate::matching::MatchOutcome;
    use crate::{Corners, PixelPoint};
    use anyhow::bail;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Matcher that blocks every search until the test releases it.
    struct GatedMatcher {
        calls: AtomicUsize,
        gate: Mutex<Receiver<()>>,
        outcome: Option<Corners>,
    }

    impl GatedMatcher {
        fn new(outcome: Option<Corners>) -> (Arc<Self>, Sender<()>) {
            let (tx, rx) = channel();
            let matcher = GatedMatcher {
                calls: AtomicUsize::new(0),
                gate: Mutex::new(rx),
                outcome,
            };
            (Arc::new(matcher), tx)
        }
    }

    impl AffineMatcher for GatedMatcher {
        fn evaluate_candidates(
            &self,
            _image: &GrayImage,
            _template: &GrayImage,
            affines: &[AffineMatrix],
            _xs: &[i32],
            _ys: &[i32],
            _photometric_invariance: bool,
        ) -> Vec<f64> {
            vec![0.0; affines.len()]
        }

        fn apply(
            &self,
            _image: &GrayImage,
            _template: &GrayImage,
            _min_rotation: f64,
            _max_rotation: f64,
        ) -> Result<MatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.lock().unwrap().recv().unwrap();
            match self.outcome {
                Some(corners) => Ok(MatchOutcome {
                    corners,
                    distance: 0.1,
                }),
                None => bail!("no match"),
            }
        }
    }

    fn wait_until_finished(matcher: &FastMatcherThread) {
        for _ in 0..500 {
            if !matcher.is_running() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("job did not finish");
    }

    fn corners() -> Corners {
        [
            PixelPoint::new(10, 20),
            PixelPoint::new(30, 20),
            PixelPoint::new(30, 40),
            PixelPoint::new(10, 40),
        ]
    }

    #[test]
    fn second_submission_is_dropped_while_running() {
        let (gated, release) = GatedMatcher::new(Some(corners()));
        let mut matcher = FastMatcherThread::new(gated.clone());
        let image = GrayImage::new(64, 64);
        let template = GrayImage::new(16, 16);
        assert!(!matcher.is_running());
        assert!(matcher.match_async(&image, &template, 0.0));
        assert!(!matcher.match_async(&image, &template, 0.0));
        assert!(matcher.is_running());
        assert!(matcher.result_if_available().is_none());
        release.send(()).unwrap();
        wait_until_finished(&matcher);
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);

        let location = matcher.result_if_available().unwrap().unwrap();
        // centre (20, 30) of the down-scaled match, scaled back up
        assert_approx_eq!(location.x, 40.0, 1e-12);
        assert_approx_eq!(location.y, 60.0, 1e-12);
        assert!(!matcher.is_running());
        assert!(matcher.result_if_available().is_none());
    }

    #[test]
    fn job_errors_surface_on_collection() {
        let (gated, release) = GatedMatcher::new(None);
        let mut matcher = FastMatcherThread::new(gated);
        release.send(()).unwrap();
        assert!(matcher.match_async(&GrayImage::new(8, 8), &GrayImage::new(4, 4), 0.0));
        wait_until_finished(&matcher);
        let result = matcher.result_if_available().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn job_panics_surface_on_collection() {
        let (gated, release) = GatedMatcher::new(Some(corners()));
        let mut matcher = FastMatcherThread::new(gated);
        // dropping the sender makes the gate's recv fail, which panics inside the job
        drop(release);
        assert!(matcher.match_async(&GrayImage::new(8, 8), &GrayImage::new(4, 4), 0.0));
        wait_until_finished(&matcher);
        let err = matcher.result_if_available().unwrap().unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn blocking_match_finds_the_crop() {
        // the product term keeps shifted windows from differing by a mere brightness offset
        let image = GrayImage::from_fn(96, 96, |x, y| {
            image::Luma([((x * 7 + y * 13 + (x * y) % 29) % 256) as u8])
        });
        let template = imageops::crop_imm(&image, 32, 40, 32, 32).to_image();
        let mut matcher = FastMatcherThread::new(Arc::new(crate::matching::SampledDistanceMatcher {
            rotation_steps: 1,
            translation_step: 1,
            scales: vec![1.0],
            sample_count: 256,
        }));
        matcher.set_scale_down_factor(1.0);
        let location = matcher.match_blocking(&image, &template, 0.0).unwrap();
        // corners (32, 40) and (63, 71)
        assert_approx_eq!(location.x, 47.5, 1e-9);
        assert_approx_eq!(location.y, 55.5, 1e-9);
    }
}
