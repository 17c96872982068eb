//! Per-frame preview strategies
//!
//! The dataset runtime hands every processed frame to a [`PreviewStrategy`]. The strategy decides
//! what, if anything, is produced and whether the run continues: returning `Ok(false)` stops the
//! run after the current frame.
//!
//! * [`HeadlessPreview`] renders nothing.
//! * [`ImagePreview`] draws the particle cloud, the best match and the ground truth onto a map
//!   window and writes it as `preview_NNNNN.png` into the output directory.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{GrayImage, Rgb, RgbImage, imageops};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;
use log::{debug, warn};
use nalgebra::Point2;

use crate::filter::Particles;
use crate::{Corners, PixelPoint};

/// Everything a preview may show for one frame.
pub struct PreviewContext<'a> {
    pub iteration: usize,
    /// Camera frame.
    pub view: &'a GrayImage,
    pub map: &'a GrayImage,
    pub particles: &'a Particles,
    /// Best-match quadrilateral in map pixels.
    pub corners: Option<Corners>,
    pub prediction: PixelPoint,
    pub ground_truth: PixelPoint,
    pub svo_position: PixelPoint,
    /// Heading in radians, clockwise from north.
    pub direction: f64,
    pub best_view: Option<&'a GrayImage>,
    /// Location reported by the background single-shot matcher.
    pub fast_match: Option<Point2<f64>>,
}

pub trait PreviewStrategy {
    /// Directory that rendered frames go to. Only called when image output is requested.
    fn set_output_directory(&mut self, _directory: &Path) {}

    /// # Returns
    /// `false` to stop the run.
    fn render(&mut self, context: &PreviewContext) -> Result<bool>;
}

/// Renders nothing and never stops the run.
#[derive(Debug, Default)]
pub struct HeadlessPreview {
    write_requested: bool,
    warned: bool,
}

impl PreviewStrategy for HeadlessPreview {
    fn set_output_directory(&mut self, _directory: &Path) {
        self.write_requested = true;
    }

    fn render(&mut self, _context: &PreviewContext) -> Result<bool> {
        if self.write_requested && !self.warned {
            self.warned = true;
            warn!("Headless mode ignores --write-images because preview rendering is disabled.");
        }
        Ok(true)
    }
}

const PARTICLE_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const MATCH_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const GROUND_TRUTH_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const PREDICTION_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const SVO_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
const FAST_MATCH_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const FRAME_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

/// Draws a map window around the prediction and saves it as PNG.
pub struct ImagePreview {
    output_directory: Option<PathBuf>,
    /// Size of the map window.
    pub window: (u32, u32),
    /// Radius of the location markers.
    pub marker_radius: i32,
    frames_written: usize,
}

impl Default for ImagePreview {
    fn default() -> Self {
        ImagePreview {
            output_directory: None,
            window: (3000, 2000),
            marker_radius: 50,
            frames_written: 0,
        }
    }
}

impl ImagePreview {
    pub fn new(window: (u32, u32), marker_radius: i32) -> Self {
        ImagePreview {
            window,
            marker_radius,
            ..ImagePreview::default()
        }
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Composes the preview frame.
    pub fn draw(&self, context: &PreviewContext) -> RgbImage {
        let (width, height) = self.window;
        // the prediction sits a third of the way in, leaving room for the insets on the right
        let origin = PixelPoint::new(
            context.prediction.x - width as i32 / 3,
            context.prediction.y - height as i32 / 2,
        );
        let to_canvas = |p: PixelPoint| PixelPoint::new(p.x - origin.x, p.y - origin.y);

        let mut canvas = RgbImage::from_fn(width, height, |x, y| {
            let mx = origin.x as i64 + x as i64;
            let my = origin.y as i64 + y as i64;
            if mx >= 0 && my >= 0 && mx < context.map.width() as i64 && my < context.map.height() as i64 {
                let v = context.map.get_pixel(mx as u32, my as u32).0[0];
                Rgb([v, v, v])
            } else {
                Rgb([0, 0, 0])
            }
        });

        for particle in context.particles {
            let p = to_canvas(particle.to_point());
            draw_filled_circle_mut(&mut canvas, (p.x, p.y), 3, PARTICLE_COLOR);
        }

        if let Some(corners) = context.corners {
            let c = corners.map(to_canvas);
            for i in 0..4 {
                let (a, b) = (c[i], c[(i + 1) % 4]);
                draw_line_segment_mut(
                    &mut canvas,
                    (a.x as f32, a.y as f32),
                    (b.x as f32, b.y as f32),
                    MATCH_COLOR,
                );
            }
            let arrowhead = ((c[0].x + c[1].x) / 2, (c[0].y + c[1].y) / 2);
            let center = ((c[0].x + c[2].x) / 2, (c[0].y + c[2].y) / 2);
            draw_line_segment_mut(
                &mut canvas,
                (center.0 as f32, center.1 as f32),
                (arrowhead.0 as f32, arrowhead.1 as f32),
                MATCH_COLOR,
            );
        }

        self.marker(&mut canvas, to_canvas(context.ground_truth), context.direction, GROUND_TRUTH_COLOR);
        self.marker(&mut canvas, to_canvas(context.prediction), context.direction, PREDICTION_COLOR);
        let svo = to_canvas(context.svo_position);
        draw_hollow_circle_mut(&mut canvas, (svo.x, svo.y), self.marker_radius / 2, SVO_COLOR);
        if let Some(location) = context.fast_match {
            let p = to_canvas(PixelPoint::new(location.x as i32, location.y as i32));
            draw_hollow_circle_mut(&mut canvas, (p.x, p.y), self.marker_radius / 2, FAST_MATCH_COLOR);
        }

        let mut inset_top = 0;
        for inset in std::iter::once(context.view).chain(context.best_view) {
            let x = width as i64 - 1 - inset.width() as i64;
            inset_top = paste(&mut canvas, inset, x, inset_top);
        }
        canvas
    }

    fn marker(&self, canvas: &mut RgbImage, location: PixelPoint, direction: f64, color: Rgb<u8>) {
        let radius = self.marker_radius;
        draw_hollow_circle_mut(canvas, (location.x, location.y), radius, color);
        let length = 4.0 * radius as f64;
        draw_line_segment_mut(
            canvas,
            (location.x as f32, location.y as f32),
            (
                (location.x as f64 + length * direction.sin()) as f32,
                (location.y as f64 - length * direction.cos()) as f32,
            ),
            color,
        );
    }
}

/// Copies `inset` onto the canvas at `(x, top)` with a frame around it.
///
/// # Returns
/// The row below the pasted inset.
fn paste(canvas: &mut RgbImage, inset: &GrayImage, x: i64, top: i64) -> i64 {
    if inset.width() == 0 || inset.height() == 0 {
        return top;
    }
    let colored = RgbImage::from_fn(inset.width(), inset.height(), |u, v| {
        let g = inset.get_pixel(u, v).0[0];
        Rgb([g, g, g])
    });
    imageops::replace(canvas, &colored, x, top);
    draw_hollow_rect_mut(
        canvas,
        Rect::at(x as i32, top as i32).of_size(inset.width(), inset.height()),
        FRAME_COLOR,
    );
    top + inset.height() as i64
}

impl PreviewStrategy for ImagePreview {
    fn set_output_directory(&mut self, directory: &Path) {
        self.output_directory = Some(directory.to_path_buf());
    }

    fn render(&mut self, context: &PreviewContext) -> Result<bool> {
        let Some(directory) = &self.output_directory else {
            return Ok(true);
        };
        let path = directory.join(format!("preview_{:05}.png", self.frames_written));
        self.draw(context)
            .save(&path)
            .with_context(|| format!("failed to write preview {}", path.display()))?;
        debug!("iteration {} preview written to {}", context.iteration, path.display());
        self.frames_written += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::{Particle, ParticleConfig, ScaleTable};
    use image::Luma;
    use std::sync::Arc;

    fn particles() -> Particles {
        let config = Arc::new(ParticleConfig::default());
        let table = Arc::new(ScaleTable::linear(1.0, 1.0, 1));
        let mut particles = Particles::with_seed(2);
        particles.add_particle(Particle::new(0, 100, 100, config.clone(), &table));
        particles.add_particle(Particle::new(1, 120, 90, config, &table));
        particles
    }

    fn context<'a>(
        view: &'a GrayImage,
        map: &'a GrayImage,
        particles: &'a Particles,
    ) -> PreviewContext<'a> {
        PreviewContext {
            iteration: 3,
            view,
            map,
            particles,
            corners: Some([
                PixelPoint::new(90, 90),
                PixelPoint::new(110, 90),
                PixelPoint::new(110, 110),
                PixelPoint::new(90, 110),
            ]),
            prediction: PixelPoint::new(100, 100),
            ground_truth: PixelPoint::new(104, 100),
            svo_position: PixelPoint::new(98, 101),
            direction: 0.3,
            best_view: None,
            fast_match: Some(Point2::new(101.0, 99.0)),
        }
    }

    #[test]
    fn headless_preview_never_stops() {
        let map = GrayImage::new(200, 200);
        let view = GrayImage::new(10, 10);
        let particles = particles();
        let mut preview = HeadlessPreview::default();
        preview.set_output_directory(Path::new("unused"));
        assert!(preview.render(&context(&view, &map, &particles)).unwrap());
        assert!(preview.render(&context(&view, &map, &particles)).unwrap());
        assert!(preview.warned);
    }

    #[test]
    fn draws_markers_and_the_camera_inset() {
        let map = GrayImage::from_pixel(200, 200, Luma([128]));
        let view = GrayImage::from_pixel(20, 10, Luma([7]));
        let particles = particles();
        let preview = ImagePreview::new((120, 80), 10);
        let canvas = preview.draw(&context(&view, &map, &particles));
        assert_eq!(canvas.dimensions(), (120, 80));
        // prediction (100, 100) lands at (40, 40); the particle at (120, 90) at (60, 30)
        assert_eq!(*canvas.get_pixel(60, 30), PARTICLE_COLOR);
        // inset in the top-right corner, framed
        assert_eq!(*canvas.get_pixel(110, 5), Rgb([7, 7, 7]));
        assert_eq!(*canvas.get_pixel(99, 0), FRAME_COLOR);
        // map grey elsewhere, black outside the map
        assert_eq!(*canvas.get_pixel(2, 75), Rgb([128, 128, 128]));
        let off_map = preview.draw(&PreviewContext {
            prediction: PixelPoint::new(0, 0),
            corners: None,
            fast_match: None,
            ..context(&view, &map, &particles)
        });
        assert_eq!(*off_map.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn writes_numbered_frames() {
        let dir = std::env::temp_dir().join("mapmatch_preview_frames");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let map = GrayImage::from_pixel(200, 200, Luma([128]));
        let view = GrayImage::from_pixel(20, 10, Luma([7]));
        let particles = particles();
        let mut preview = ImagePreview::new((64, 48), 5);
        assert!(preview.render(&context(&view, &map, &particles)).unwrap());
        assert_eq!(preview.frames_written(), 0);
        preview.set_output_directory(&dir);
        assert!(preview.render(&context(&view, &map, &particles)).unwrap());
        assert!(preview.render(&context(&view, &map, &particles)).unwrap());
        assert!(dir.join("preview_00000.png").exists());
        assert!(dir.join("preview_00001.png").exists());
        assert_eq!(preview.frames_written(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
