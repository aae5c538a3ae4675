//! Drawing of detections onto frames.
//!
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::Scale;

use crate::nn::Detection;

const FONT_SCALE: Scale = Scale { x: 16.0, y: 16.0 };

const PALETTE: [[u8; 3]; 8] = [
    [0, 255, 0],
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
];

lazy_static! {
    static ref DEJAVU_MONO: rusttype::Font<'static> = {
        let font_data: &[u8] = include_bytes!("../resources/DejaVuSansMono.ttf");
        let font: rusttype::Font<'static> =
            rusttype::Font::try_from_bytes(font_data).expect("failed to load font");
        font
    };
}

/// Colour used for a class.
pub fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Draw bounding boxes with label and confidence onto the frame.
pub fn draw_bboxes_on_image(frame: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    if frame.width() == 0 || frame.height() == 0 {
        return;
    }

    for detection in detections {
        let color = class_color(detection.class_id);
        let bbox = detection.bbox;

        // Coordinate frame basis is on the top left corner
        let (x_tl, y_tl) = (bbox[0] * width, bbox[1] * height);
        let (x_br, y_br) = (bbox[2] * width, bbox[3] * height);
        let rect_width = (x_br - x_tl).max(1.0) as u32;
        let rect_height = (y_br - y_tl).max(1.0) as u32;

        let rect = Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width, rect_height);
        draw_hollow_rect_mut(frame, rect, color);

        let text = format!("{} {:.2}", detection.label, detection.confidence);
        let (text_width, text_height) = text_size(FONT_SCALE, &DEJAVU_MONO, &text);
        let (text_width, text_height) = (text_width.max(1) as u32 + 2, text_height.max(1) as u32 + 2);

        // Put the label above the box, or inside it at the top edge of the image
        let label_y = if y_tl as i32 >= text_height as i32 {
            y_tl as i32 - text_height as i32
        } else {
            y_tl as i32
        };
        draw_filled_rect_mut(
            frame,
            Rect::at(x_tl as i32, label_y).of_size(text_width, text_height),
            color,
        );
        draw_text_mut(
            frame,
            Rgb([0, 0, 0]),
            x_tl as i32 + 1,
            label_y + 1,
            FONT_SCALE,
            &DEJAVU_MONO,
            &text,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(bbox: [f32; 4]) -> Detection {
        Detection {
            class_id: 0,
            label: "person".into(),
            confidence: 0.87,
            bbox,
        }
    }

    #[test]
    fn draws_box_outline_in_class_color() {
        let mut frame = RgbImage::new(100, 100);
        draw_bboxes_on_image(&mut frame, &[detection([0.2, 0.5, 0.8, 0.9])]);

        let color = class_color(0);
        // Left edge of the box, below the label
        assert_eq!(*frame.get_pixel(20, 80), color);
        // Inside of the box stays untouched
        assert_eq!(*frame.get_pixel(50, 70), Rgb([0, 0, 0]));
    }

    #[test]
    fn tolerates_degenerate_and_edge_boxes() {
        let mut frame = RgbImage::new(40, 30);
        draw_bboxes_on_image(
            &mut frame,
            &[
                detection([0.5, 0.5, 0.5, 0.5]),
                detection([0.0, 0.0, 1.0, 1.0]),
                detection([0.9, 0.9, 1.0, 1.0]),
            ],
        );

        let mut empty = RgbImage::new(0, 0);
        draw_bboxes_on_image(&mut empty, &[detection([0.0, 0.0, 1.0, 1.0])]);
    }

    #[test]
    fn no_detections_leave_frame_unchanged() {
        let mut frame = RgbImage::from_pixel(10, 10, Rgb([7, 7, 7]));
        let before = frame.clone();
        draw_bboxes_on_image(&mut frame, &[]);
        assert_eq!(frame, before);
    }
}
