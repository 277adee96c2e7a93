use opencv::{
    core::{Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

use crate::frame::{Overlay, TrackOverlay};

// BGR
const MAGENTA: Scalar = Scalar::new(255.0, 0.0, 255.0, 0.0);
const GREEN: Scalar = Scalar::new(0.0, 255.0, 0.0, 0.0);
const RED: Scalar = Scalar::new(0.0, 0.0, 255.0, 0.0);
const WHITE: Scalar = Scalar::new(255.0, 255.0, 255.0, 0.0);
const COUNT_COLOR: Scalar = Scalar::new(50.0, 50.0, 255.0, 0.0);

/// Thin rectangle with thick corner ticks.
pub fn draw_corner_rect(frame: &mut Mat, rect: Rect, len: i32, thickness: i32, color: Scalar) -> opencv::Result<()> {
    imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

    let (x1, y1) = (rect.x, rect.y);
    let (x2, y2) = (rect.x + rect.width, rect.y + rect.height);
    let len = len.min(rect.width / 2).min(rect.height / 2).max(1);
    let corners = [
        (Point::new(x1, y1), Point::new(x1 + len, y1), Point::new(x1, y1 + len)),
        (Point::new(x2, y1), Point::new(x2 - len, y1), Point::new(x2, y1 + len)),
        (Point::new(x1, y2), Point::new(x1 + len, y2), Point::new(x1, y2 - len)),
        (Point::new(x2, y2), Point::new(x2 - len, y2), Point::new(x2, y2 - len)),
    ];
    for (corner, h_end, v_end) in corners {
        imgproc::line(frame, corner, h_end, GREEN, thickness, imgproc::LINE_8, 0)?;
        imgproc::line(frame, corner, v_end, GREEN, thickness, imgproc::LINE_8, 0)?;
    }
    Ok(())
}

/// Text on a filled background box whose bottom-left corner is `origin`.
pub fn draw_label(
    frame: &mut Mat,
    text: &str,
    origin: Point,
    font_scale: f64,
    thickness: i32,
    offset: i32,
) -> opencv::Result<()> {
    let mut baseline = 0;
    let text_size = imgproc::get_text_size(text, imgproc::FONT_HERSHEY_PLAIN, font_scale, thickness, &mut baseline)?;

    let bg_rect = Rect::new(
        origin.x - offset,
        origin.y - text_size.height - offset,
        text_size.width + 2 * offset,
        text_size.height + 2 * offset,
    );
    imgproc::rectangle(frame, bg_rect, MAGENTA, -1, imgproc::LINE_8, 0)?;

    imgproc::put_text(
        frame,
        text,
        origin,
        imgproc::FONT_HERSHEY_PLAIN,
        font_scale,
        WHITE,
        thickness,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

pub fn draw_track(frame: &mut Mat, track: &TrackOverlay) -> opencv::Result<()> {
    let [x, y, w, h] = track.rect;
    draw_corner_rect(frame, Rect::new(x, y, w, h), 9, 5, MAGENTA)?;
    draw_label(frame, &format!(" {}", track.track_id), Point::new(x.max(0), y.max(35)), 2.0, 3, 10)?;

    let (cx, cy) = track.centroid;
    imgproc::circle(frame, Point::new(cx, cy), 5, MAGENTA, imgproc::FILLED, imgproc::LINE_8, 0)?;
    Ok(())
}

/// Counting line, confirmed tracks and the running count.
pub fn draw_overlay(frame: &mut Mat, overlay: &Overlay) -> opencv::Result<()> {
    let start = Point::new(overlay.line_start.x, overlay.line_start.y);
    let end = Point::new(overlay.line_end.x, overlay.line_end.y);
    imgproc::line(frame, start, end, RED, 5, imgproc::LINE_8, 0)?;

    for track in &overlay.tracks {
        draw_track(frame, track)?;
    }

    if overlay.flash {
        imgproc::line(frame, start, end, GREEN, 5, imgproc::LINE_8, 0)?;
    }

    imgproc::put_text(
        frame,
        &overlay.count.to_string(),
        Point::new(255, 100),
        imgproc::FONT_HERSHEY_PLAIN,
        5.0,
        COUNT_COLOR,
        8,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Pause hint drawn on the window copy of a frame.
pub fn draw_paused(frame: &mut Mat) -> opencv::Result<()> {
    imgproc::put_text(
        frame,
        "PAUSED",
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.8,
        WHITE,
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}
