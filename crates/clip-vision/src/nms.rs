use crate::Bbox;

/// Intersection over union of two corner-form boxes. Zero when they do not
/// overlap or when the union is empty.
pub fn iou(a: &Bbox, b: &Bbox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
