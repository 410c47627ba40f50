use ndarray::{Array3, ArrayViewMut1, Axis, Zip};

use crate::volume::{Point3, Volume};

/// Squared distance along one lane to the nearest finite sample of `f`, using the lower
/// envelope of parabolas rooted at every finite sample.
fn lane_transform(mut lane: ArrayViewMut1<f64>, spacing: f64) {
    let f: Vec<f64> = lane.iter().copied().collect();
    let roots: Vec<usize> = (0..f.len()).filter(|&q| f[q].is_finite()).collect();
    if roots.is_empty() {
        return;
    }

    let position = |q: usize| q as f64 * spacing;
    let intersect = |a: usize, b: usize| {
        ((f[b] + position(b).powi(2)) - (f[a] + position(a).powi(2)))
            / (2.0 * (position(b) - position(a)))
    };

    let mut vertices: Vec<usize> = Vec::with_capacity(roots.len());
    let mut bounds: Vec<f64> = Vec::with_capacity(roots.len() + 1);
    for &q in &roots {
        loop {
            match vertices.last() {
                Some(&v) => {
                    let s = intersect(v, q);
                    if s <= bounds[bounds.len() - 1] {
                        vertices.pop();
                        bounds.pop();
                    } else {
                        vertices.push(q);
                        bounds.push(s);
                        break;
                    }
                }
                None => {
                    vertices.push(q);
                    bounds.push(f64::NEG_INFINITY);
                    break;
                }
            }
        }
    }
    bounds.push(f64::INFINITY);

    let mut k = 0;
    for (p, out) in lane.iter_mut().enumerate() {
        let x = position(p);
        while bounds[k + 1] < x {
            k += 1;
        }
        let v = vertices[k];
        *out = (x - position(v)).powi(2) + f[v];
    }
}

/// Euclidean distance in millimetres from every voxel to the nearest voxel where
/// `feature` is true. Returns `None` when there is no feature voxel.
pub fn distance_transform<F>(volume: &Volume<u8>, feature: F) -> Option<Array3<f64>>
where
    F: Fn(u8) -> bool,
{
    let mut squared = volume
        .data()
        .map(|&v| if feature(v) { 0.0 } else { f64::INFINITY });
    if squared.iter().all(|v| v.is_infinite()) {
        return None;
    }
    let spacing: Point3 = volume.spacing();
    for axis in 0..3 {
        Zip::from(squared.lanes_mut(Axis(axis)))
            .par_for_each(|lane| lane_transform(lane, spacing[axis]));
    }
    squared.mapv_inplace(f64::sqrt);
    Some(squared)
}

/// Signed Euclidean distance map of a binary mask in millimetres, negative inside.
/// An empty mask gives the grid diagonal everywhere and a full mask its negation.
pub fn signed_distance_map(mask: &Volume<u8>) -> Volume<f32> {
    let diagonal = mask.geometry().diagonal() as f32;
    let outside = distance_transform(mask, |v| v != 0);
    let inside = distance_transform(mask, |v| v == 0);
    match (outside, inside) {
        (None, _) => Volume::from_elem(&mask.geometry(), diagonal),
        (_, None) => Volume::from_elem(&mask.geometry(), -diagonal),
        (Some(outside), Some(inside)) => {
            let mut result = Volume::zeros(&mask.geometry());
            Zip::from(result.data_mut())
                .and(mask.data())
                .and(&outside)
                .and(&inside)
                .for_each(|out, &m, &o, &i| {
                    *out = if m != 0 { -(i as f32) } else { o as f32 };
                });
            result
        }
    }
}
