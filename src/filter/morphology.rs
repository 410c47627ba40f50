use ndarray::Array3;
use std::collections::VecDeque;

use crate::volume::{Index3, Volume};

const FACE_OFFSETS: [[isize; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// Face-connected neighbours of `voxel` that lie inside a grid of extent `size`
pub fn face_neighbours(voxel: Index3, size: Index3) -> impl Iterator<Item = Index3> {
    FACE_OFFSETS.into_iter().filter_map(move |offset| {
        let mut neighbour = [0usize; 3];
        for axis in 0..3 {
            let coord = voxel[axis] as isize + offset[axis];
            if coord < 0 || coord >= size[axis] as isize {
                return None;
            }
            neighbour[axis] = coord as usize;
        }
        Some(neighbour)
    })
}

/// Foreground voxels with at least one face neighbour in the background.
/// Voxels on the grid border count as boundary.
pub fn boundary_voxels(mask: &Volume<u8>) -> Vec<Index3> {
    let size = mask.size();
    let data = mask.data();
    data.indexed_iter()
        .filter(|&(_, &v)| v != 0)
        .map(|((x, y, z), _)| [x, y, z])
        .filter(|&voxel| {
            let on_border = (0..3).any(|axis| voxel[axis] == 0 || voxel[axis] + 1 == size[axis]);
            on_border || face_neighbours(voxel, size).any(|n| data[n] == 0)
        })
        .collect()
}

/// 6-connected component labelling of voxels for which `include` holds.
/// Returns the label volume (0 for excluded voxels) and the voxel count of every component,
/// where component `i` carries label `i + 1`.
pub fn label_components<F>(mask: &Volume<u8>, include: F) -> (Array3<u32>, Vec<usize>)
where
    F: Fn(u8) -> bool,
{
    let size = mask.size();
    let data = mask.data();
    let mut labels = Array3::<u32>::zeros(size);
    let mut counts = Vec::new();
    let mut queue = VecDeque::new();

    for ((x, y, z), &value) in data.indexed_iter() {
        if !include(value) || labels[[x, y, z]] != 0 {
            continue;
        }
        counts.push(0);
        let label = counts.len() as u32;
        labels[[x, y, z]] = label;
        queue.push_back([x, y, z]);
        while let Some(voxel) = queue.pop_front() {
            counts[label as usize - 1] += 1;
            for neighbour in face_neighbours(voxel, size) {
                if include(data[neighbour]) && labels[neighbour] == 0 {
                    labels[neighbour] = label;
                    queue.push_back(neighbour);
                }
            }
        }
    }
    (labels, counts)
}

/// Keep only the largest 6-connected foreground component
pub fn largest_component(mask: &Volume<u8>) -> Volume<u8> {
    let (labels, counts) = label_components(mask, |v| v != 0);
    let Some((largest, _)) = counts.iter().enumerate().max_by_key(|&(i, &c)| (c, std::cmp::Reverse(i)))
    else {
        return mask.clone();
    };
    let keep = largest as u32 + 1;
    Volume::from_array(
        labels.map(|&l| u8::from(l == keep)),
        mask.spacing(),
        mask.origin(),
    )
}

/// Fill background regions that are not connected to the grid border
pub fn fill_holes(mask: &Volume<u8>) -> Volume<u8> {
    let size = mask.size();
    let (labels, counts) = label_components(mask, |v| v == 0);
    let mut touches_border = vec![false; counts.len()];
    for ((x, y, z), &label) in labels.indexed_iter() {
        let on_border = [x, y, z]
            .iter()
            .zip(size)
            .any(|(&c, s)| c == 0 || c + 1 == s);
        if label != 0 && on_border {
            touches_border[label as usize - 1] = true;
        }
    }
    Volume::from_array(
        labels.map(|&l| u8::from(l == 0 || !touches_border[l as usize - 1])),
        mask.spacing(),
        mask.origin(),
    )
}

/// Centre of mass of a binary mask in voxel coordinates
pub fn centroid(mask: &Volume<u8>) -> Option<[f64; 3]> {
    let mut sum = [0.0f64; 3];
    let mut count = 0usize;
    for ((x, y, z), _) in mask.data().indexed_iter().filter(|&(_, &v)| v != 0) {
        sum[0] += x as f64;
        sum[1] += y as f64;
        sum[2] += z as f64;
        count += 1;
    }
    (count > 0).then(|| sum.map(|s| s / count as f64))
}
