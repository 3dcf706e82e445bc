//! Balanced spatial partition over a point cloud.
//!
//! The tree recursively splits the cloud along its highest-variance axis,
//! bottoming out in small leaf clumps, and supports branch-and-bound
//! support-vertex queries (the most extreme point along a direction). Nodes
//! live in a contiguous vector and reference children by index.

use na::Vector3;

/// Points per leaf clump.
const LEAF_SIZE: usize = 8;

const NO_CHILD: u32 = crate::INVALID_U32;

#[derive(Clone, Copy, Debug)]
struct Node {
    min: Vector3<f64>,
    max: Vector3<f64>,
    left: u32,
    right: u32,
    // Range into the permuted point order; only meaningful for leaves.
    start: u32,
    count: u32,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.left == NO_CHILD
    }

    /// Upper bound of `dir · p` over every point inside this node's box.
    fn support_bound(&self, dir: &Vector3<f64>) -> f64 {
        let mut bound = 0.0;
        for i in 0..3 {
            bound += dir[i] * if dir[i] >= 0.0 { self.max[i] } else { self.min[i] };
        }
        bound
    }
}

/// A static AABB tree over a point cloud.
pub(crate) struct AabbPointTree {
    nodes: Vec<Node>,
    order: Vec<u32>,
    root: u32,
}

impl AabbPointTree {
    /// Builds the tree. `points` must be non-empty.
    pub fn new(points: &[Vector3<f64>]) -> Self {
        debug_assert!(!points.is_empty());
        let mut tree = AabbPointTree {
            nodes: Vec::with_capacity(points.len() / LEAF_SIZE * 2 + 1),
            order: (0..points.len() as u32).collect(),
            root: 0,
        };
        tree.root = tree.build(points, 0, points.len());
        tree
    }

    fn build(&mut self, points: &[Vector3<f64>], start: usize, end: usize) -> u32 {
        let range = &self.order[start..end];
        let mut min = points[range[0] as usize];
        let mut max = min;
        let mut mean = Vector3::zeros();
        for &i in range {
            let p = points[i as usize];
            min = min.inf(&p);
            max = max.sup(&p);
            mean += p;
        }
        mean /= range.len() as f64;

        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            min,
            max,
            left: NO_CHILD,
            right: NO_CHILD,
            start: start as u32,
            count: (end - start) as u32,
        });

        if end - start > LEAF_SIZE {
            // Split along the highest-variance axis, around the mean.
            let mut var = Vector3::zeros();
            for &i in &self.order[start..end] {
                let d = points[i as usize] - mean;
                var += d.component_mul(&d);
            }
            let axis = var.imax();

            let mut mid = start;
            for i in start..end {
                if points[self.order[i] as usize][axis] < mean[axis] {
                    self.order.swap(i, mid);
                    mid += 1;
                }
            }
            // Coincident coordinates can push everything to one side.
            if mid == start || mid == end {
                mid = (start + end) / 2;
            }

            let left = self.build(points, start, mid);
            let right = self.build(points, mid, end);
            self.nodes[id as usize].left = left;
            self.nodes[id as usize].right = right;
        }

        id
    }

    /// Index of the point most extreme along `dir`, pruned with the nodes'
    /// bounding boxes.
    pub fn support_vertex(&self, points: &[Vector3<f64>], dir: &Vector3<f64>) -> usize {
        let mut best = f64::NEG_INFINITY;
        let mut best_index = self.order[self.nodes[self.root as usize].start as usize] as usize;

        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if node.support_bound(dir) <= best {
                continue;
            }

            if node.is_leaf() {
                let start = node.start as usize;
                for &i in &self.order[start..start + node.count as usize] {
                    let d = dir.dot(&points[i as usize]);
                    if d > best {
                        best = d;
                        best_index = i as usize;
                    }
                }
            } else {
                // Descend into the more promising child first.
                let l = &self.nodes[node.left as usize];
                let r = &self.nodes[node.right as usize];
                if l.support_bound(dir) > r.support_bound(dir) {
                    stack.push(node.right);
                    stack.push(node.left);
                } else {
                    stack.push(node.left);
                    stack.push(node.right);
                }
            }
        }

        best_index
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn grid_cloud() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for x in 0..5 {
            for y in 0..4 {
                for z in 0..3 {
                    pts.push(Vector3::new(x as f64, y as f64 * 2.0, z as f64 - 1.0));
                }
            }
        }
        pts
    }

    #[test]
    fn support_matches_linear_scan() {
        let pts = grid_cloud();
        let tree = AabbPointTree::new(&pts);

        let dirs = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.3, -0.7, 0.2),
            Vector3::new(-0.5, 0.5, -1.5),
        ];
        for dir in dirs {
            let found = tree.support_vertex(&pts, &dir);
            let best = pts
                .iter()
                .map(|p| dir.dot(p))
                .fold(f64::NEG_INFINITY, f64::max);
            assert_eq!(dir.dot(&pts[found]), best);
        }
    }

    #[test]
    fn handles_tiny_clouds() {
        let pts = vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(-1.0, 0.0, 0.0)];
        let tree = AabbPointTree::new(&pts);
        assert_eq!(tree.support_vertex(&pts, &Vector3::new(1.0, 0.0, 0.0)), 0);
        assert_eq!(tree.support_vertex(&pts, &Vector3::new(-1.0, 0.0, 0.0)), 1);
    }

    #[test]
    fn handles_coincident_points() {
        let pts = vec![Vector3::new(1.0, 1.0, 1.0); 40];
        let tree = AabbPointTree::new(&pts);
        let found = tree.support_vertex(&pts, &Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(pts[found], Vector3::new(1.0, 1.0, 1.0));
    }
}
