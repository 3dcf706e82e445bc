//! Incremental 3D convex hull construction.
//!
//! QuickHull-style algorithm: a spatial point tree provides support-vertex
//! queries, an evenly distributed direction list seeds a non-degenerate
//! starting tetrahedron, and faces are then expanded one extreme point at a
//! time: all faces visible from the new point are deleted and replaced by a
//! cone of new faces stitched back into the twin-link structure.
//!
//! Orientation decisions too close to zero to trust double precision are
//! promoted to exact expansion arithmetic, so ties never produce an
//! inconsistent or self-intersecting hull.

use super::exact::Expansion;
use super::point_tree::AabbPointTree;
use crate::error::Error;
use crate::math::{Point, Real, Vector};
use na::Vector3;
use std::collections::HashMap;

const NO_TWIN: u32 = crate::INVALID_U32;

/// Error-bound factor of the double-precision orientation filter. Generous
/// compared to the theoretical bound, which only means the exact path runs
/// slightly more often.
const ORIENT_FILTER: f64 = 1.0e-13;

#[derive(Clone, Debug)]
struct BuildFace {
    v: [u32; 3],
    /// `twin[e]` encodes `face * 3 + edge` of the reversed directed edge
    /// `v[e] -> v[(e + 1) % 3]`.
    twin: [u32; 3],
    normal: Vector3<f64>,
    alive: bool,
}

/// A closed convex polytope produced by [`ConvexHull3::try_new`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ConvexHull3 {
    vertices: Vec<Point<Real>>,
    faces: Vec<[u32; 3]>,
}

impl ConvexHull3 {
    /// Builds the convex hull of `points`.
    ///
    /// `dist_tol` is the absolute distance below which a point is considered
    /// to lie on the hull surface and is not added as a vertex. Inputs with
    /// fewer than 4 affinely independent points (within the tolerance) are
    /// rejected with [`Error::DegenerateGeometry`].
    pub fn try_new(points: &[Point<Real>], dist_tol: Real) -> Result<Self, Error> {
        if points.len() < 4 {
            return Err(Error::DegenerateGeometry(
                "convex hull requires at least 4 points",
            ));
        }

        let cloud: Vec<Vector3<f64>> = points
            .iter()
            .map(|p| Vector3::new(p.x as f64, p.y as f64, p.z as f64))
            .collect();
        let tol = (dist_tol as f64).max(0.0);

        let builder = HullBuilder::new(&cloud, tol)?;
        Ok(builder.finish(points))
    }

    /// The hull vertices. Every vertex is one of the input points.
    pub fn vertices(&self) -> &[Point<Real>] {
        &self.vertices
    }

    /// The hull triangles, wound counter-clockwise seen from outside.
    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    /// Returns `true` when `point` lies inside the hull or within `tol` of
    /// its surface.
    pub fn contains_point(&self, point: &Point<Real>, tol: Real) -> bool {
        for face in &self.faces {
            let a = self.vertices[face[0] as usize];
            let b = self.vertices[face[1] as usize];
            let c = self.vertices[face[2] as usize];
            let n = (b - a).cross(&(c - a));
            let len = n.norm();
            if len < 1.0e-12 {
                continue;
            }
            if (point - a).dot(&n) / len > tol {
                return false;
            }
        }
        true
    }

    /// The support point of the hull along `dir`.
    pub fn support_point(&self, dir: &Vector<Real>) -> Point<Real> {
        let mut best = self.vertices[0];
        let mut best_dot = dir.dot(&best.coords);
        for v in &self.vertices[1..] {
            let d = dir.dot(&v.coords);
            if d > best_dot {
                best_dot = d;
                best = *v;
            }
        }
        best
    }
}

struct HullBuilder<'a> {
    cloud: &'a [Vector3<f64>],
    tree: AabbPointTree,
    tol: f64,
    faces: Vec<BuildFace>,
}

impl<'a> HullBuilder<'a> {
    fn new(cloud: &'a [Vector3<f64>], tol: f64) -> Result<Self, Error> {
        let tree = AabbPointTree::new(cloud);
        let mut builder = HullBuilder {
            cloud,
            tree,
            tol,
            faces: Vec::with_capacity(cloud.len() * 2),
        };

        let seed = builder.seed_tetrahedron()?;
        builder.push_tetrahedron(seed);
        builder.expand()?;
        Ok(builder)
    }

    /// Picks 4 affinely independent seed points, rejecting colinear/coplanar
    /// choices; the final orientation decision goes through the exact
    /// predicate when the double-precision volume is inconclusive.
    fn seed_tetrahedron(&self) -> Result<[u32; 4], Error> {
        let cloud = self.cloud;
        let dirs = normal_directions();

        // The two most distant support points across the direction list.
        let v0 = self.tree.support_vertex(cloud, &dirs[0]);
        let mut v1 = v0;
        let mut best = 0.0;
        for dir in &dirs {
            let i = self.tree.support_vertex(cloud, dir);
            let d2 = (cloud[i] - cloud[v0]).norm_squared();
            if d2 > best {
                best = d2;
                v1 = i;
            }
        }
        if best.sqrt() <= self.tol {
            return Err(Error::DegenerateGeometry("point cloud collapses to a point"));
        }

        // Third point: farthest from the line (v0, v1).
        let axis = (cloud[v1] - cloud[v0]).normalize();
        let mut v2 = v0;
        let mut best = 0.0;
        for (i, p) in cloud.iter().enumerate() {
            let d2 = axis.cross(&(p - cloud[v0])).norm_squared();
            if d2 > best {
                best = d2;
                v2 = i;
            }
        }
        if best.sqrt() <= self.tol {
            return Err(Error::DegenerateGeometry("point cloud collapses to a line"));
        }

        // Fourth point: farthest from the plane (v0, v1, v2).
        let n = (cloud[v1] - cloud[v0])
            .cross(&(cloud[v2] - cloud[v0]))
            .normalize();
        let mut v3 = v0;
        let mut best = 0.0;
        for (i, p) in cloud.iter().enumerate() {
            let d = n.dot(&(p - cloud[v0])).abs();
            if d > best {
                best = d;
                v3 = i;
            }
        }
        if best <= self.tol {
            return Err(Error::DegenerateGeometry("point cloud collapses to a plane"));
        }

        // Orient so that v3 lies below the (v0, v1, v2) face.
        let mut seed = [v0 as u32, v1 as u32, v2 as u32, v3 as u32];
        if orient(cloud, v0, v1, v2, v3) > 0.0 {
            seed.swap(1, 2);
        }
        Ok(seed)
    }

    fn push_tetrahedron(&mut self, seed: [u32; 4]) {
        let [a, b, c, d] = seed;
        for verts in [[a, b, c], [a, d, b], [b, d, c], [a, c, d]] {
            self.push_face(verts);
        }
        self.link_all_twins();
    }

    fn push_face(&mut self, v: [u32; 3]) -> u32 {
        let p0 = self.cloud[v[0] as usize];
        let normal = (self.cloud[v[1] as usize] - p0).cross(&(self.cloud[v[2] as usize] - p0));
        self.faces.push(BuildFace {
            v,
            twin: [NO_TWIN; 3],
            normal,
            alive: true,
        });
        (self.faces.len() - 1) as u32
    }

    /// Rebuilds every twin link from scratch. Only used for the seed
    /// tetrahedron; cone stitching links incrementally.
    fn link_all_twins(&mut self) {
        let mut edges: HashMap<(u32, u32), u32> = HashMap::new();
        for (fid, face) in self.faces.iter().enumerate() {
            if !face.alive {
                continue;
            }
            for e in 0..3 {
                let tail = face.v[e];
                let head = face.v[(e + 1) % 3];
                edges.insert((tail, head), fid as u32 * 3 + e as u32);
            }
        }
        for face in self.faces.iter_mut().filter(|f| f.alive) {
            for e in 0..3 {
                let tail = face.v[e];
                let head = face.v[(e + 1) % 3];
                face.twin[e] = edges[&(head, tail)];
            }
        }
    }

    /// Main loop: repeatedly finds a face with a point beyond the tolerance
    /// and inserts that point, until every point lies on or inside the hull.
    fn expand(&mut self) -> Result<(), Error> {
        let mut stack: Vec<u32> = (0..self.faces.len() as u32).collect();
        let mut budget = self.cloud.len() * 8 + 64;

        while let Some(fid) = stack.pop() {
            if !self.faces[fid as usize].alive {
                continue;
            }

            if budget == 0 {
                log::warn!("convex hull expansion exceeded its iteration budget");
                return Err(Error::IllConditionedSystem(
                    "convex hull expansion did not converge",
                ));
            }
            budget -= 1;

            let face = &self.faces[fid as usize];
            let normal_len = face.normal.norm();
            if normal_len < 1.0e-30 {
                // Sliver face left over from a coplanar insertion.
                continue;
            }
            let apex = self.tree.support_vertex(self.cloud, &face.normal);
            if face.v.contains(&(apex as u32)) {
                continue;
            }
            let p0 = self.cloud[face.v[0] as usize];
            let dist = face.normal.dot(&(self.cloud[apex] - p0)) / normal_len;
            if dist <= self.tol {
                continue;
            }

            self.insert_point(apex as u32, fid, &mut stack)?;
        }
        Ok(())
    }

    /// Deletes every face visible from `apex` (flood fill through twin
    /// links), then stitches a cone of new faces over the horizon loop.
    fn insert_point(&mut self, apex: u32, seed_face: u32, stack: &mut Vec<u32>) -> Result<(), Error> {
        // Flood fill of the visible region.
        let mut visible = vec![seed_face];
        let mut visited: HashMap<u32, bool> = HashMap::new();
        visited.insert(seed_face, true);
        let mut queue = vec![seed_face];
        // Horizon edges, keyed by tail vertex: tail -> (head, hidden edge slot).
        let mut horizon: HashMap<u32, (u32, u32)> = HashMap::new();

        while let Some(fid) = queue.pop() {
            let face = self.faces[fid as usize].clone();
            for e in 0..3 {
                let twin_slot = face.twin[e];
                let nfid = twin_slot / 3;
                let seen = visited.get(&nfid).copied();
                let neighbor_visible = match seen {
                    Some(v) => v,
                    None => {
                        let nface = &self.faces[nfid as usize];
                        let v = orient(
                            self.cloud,
                            nface.v[0] as usize,
                            nface.v[1] as usize,
                            nface.v[2] as usize,
                            apex as usize,
                        ) > 0.0;
                        visited.insert(nfid, v);
                        if v {
                            visible.push(nfid);
                            queue.push(nfid);
                        }
                        v
                    }
                };
                if !neighbor_visible {
                    // The boundary edge of the visible region, oriented as it
                    // appears in the visible face.
                    horizon.insert(face.v[e], (face.v[(e + 1) % 3], twin_slot));
                }
            }
        }

        for &fid in &visible {
            self.faces[fid as usize].alive = false;
        }

        // Walk the horizon loop and build the cone.
        let loop_len = horizon.len();
        let Some(&start) = horizon.keys().next() else {
            return Err(Error::IllConditionedSystem("convex hull horizon is empty"));
        };
        let mut cone = Vec::with_capacity(loop_len);
        let mut tail = start;
        for k in 0..loop_len {
            if k > 0 && tail == start {
                return Err(Error::IllConditionedSystem("convex hull horizon is broken"));
            }
            let Some(&(head, hidden_slot)) = horizon.get(&tail) else {
                return Err(Error::IllConditionedSystem("convex hull horizon is broken"));
            };
            let new_fid = self.push_face([tail, head, apex]);
            cone.push((new_fid, hidden_slot));
            tail = head;
        }
        if tail != start || cone.len() != loop_len {
            return Err(Error::IllConditionedSystem("convex hull horizon is broken"));
        }

        // Twin stitching: edge 0 pairs with the surviving neighbor, edges 1
        // and 2 pair with the adjacent cone faces.
        let n = cone.len();
        for (k, &(fid, hidden_slot)) in cone.iter().enumerate() {
            let next = cone[(k + 1) % n].0;
            let prev = cone[(k + n - 1) % n].0;
            {
                let face = &mut self.faces[fid as usize];
                face.twin[0] = hidden_slot;
                face.twin[1] = next * 3 + 2;
                face.twin[2] = prev * 3 + 1;
            }
            let hidden_face = (hidden_slot / 3) as usize;
            let hidden_edge = (hidden_slot % 3) as usize;
            self.faces[hidden_face].twin[hidden_edge] = fid * 3;
            stack.push(fid);
        }

        Ok(())
    }

    /// Compacts the surviving faces into the public representation.
    fn finish(self, points: &[Point<Real>]) -> ConvexHull3 {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut vertices = Vec::new();
        let mut faces = Vec::new();

        for face in self.faces.iter().filter(|f| f.alive) {
            let mut out = [0u32; 3];
            for (k, &v) in face.v.iter().enumerate() {
                let id = *remap.entry(v).or_insert_with(|| {
                    vertices.push(points[v as usize]);
                    (vertices.len() - 1) as u32
                });
                out[k] = id;
            }
            faces.push(out);
        }

        ConvexHull3 { vertices, faces }
    }
}

/// Robust orientation predicate: the sign of the signed volume of the
/// tetrahedron `(a, b, c, d)`, positive when `d` lies on the positive side of
/// the counter-clockwise triangle `(a, b, c)`.
///
/// Evaluated in double precision with a magnitude-based error filter;
/// inconclusive results are recomputed with exact expansion arithmetic.
fn orient(cloud: &[Vector3<f64>], a: usize, b: usize, c: usize, d: usize) -> f64 {
    let u = cloud[b] - cloud[a];
    let v = cloud[c] - cloud[a];
    let w = cloud[d] - cloud[a];
    let det = u.cross(&v).dot(&w);

    let pu = u.abs();
    let pv = v.abs();
    let pw = w.abs();
    let permanent = pu.x * (pv.y * pw.z + pv.z * pw.y)
        + pu.y * (pv.x * pw.z + pv.z * pw.x)
        + pu.z * (pv.x * pw.y + pv.y * pw.x);
    let bound = ORIENT_FILTER * permanent;

    if det > bound || det < -bound {
        return det.signum();
    }
    orient_exact(cloud, a, b, c, d)
}

fn orient_exact(cloud: &[Vector3<f64>], a: usize, b: usize, c: usize, d: usize) -> f64 {
    let diff = |i: usize, k: usize| {
        Expansion::from_f64(cloud[i][k]) - Expansion::from_f64(cloud[a][k])
    };
    let (ux, uy, uz) = (diff(b, 0), diff(b, 1), diff(b, 2));
    let (vx, vy, vz) = (diff(c, 0), diff(c, 1), diff(c, 2));
    let (wx, wy, wz) = (diff(d, 0), diff(d, 1), diff(d, 2));

    let det = ux * (vy * wz - vz * wy) - uy * (vx * wz - vz * wx) + uz * (vx * wy - vy * wx);
    det.signum()
}

/// Evenly distributed directions over the sphere: the vertices and face
/// normals of an icosahedron.
fn normal_directions() -> Vec<Vector3<f64>> {
    let phi = (1.0 + 5.0f64.sqrt()) / 2.0;
    let mut verts = Vec::with_capacity(12);
    for &a in &[-1.0, 1.0] {
        for &b in &[-phi, phi] {
            verts.push(Vector3::new(0.0, a, b).normalize());
            verts.push(Vector3::new(a, b, 0.0).normalize());
            verts.push(Vector3::new(b, 0.0, a).normalize());
        }
    }

    // Midpoints between adjacent vertices densify the sampling, approximating
    // one icosahedral subdivision. Adjacent icosahedron vertices are 1/sqrt(5)
    // apart in cosine.
    let mut dirs = verts.clone();
    for i in 0..verts.len() {
        for j in (i + 1)..verts.len() {
            if verts[i].dot(&verts[j]) > 0.4 {
                dirs.push((verts[i] + verts[j]).normalize());
            }
        }
    }
    dirs
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn cube_points() -> Vec<Point<Real>> {
        let mut pts = Vec::new();
        for &x in &[-1.0, 1.0] {
            for &y in &[-1.0, 1.0] {
                for &z in &[-1.0, 1.0] {
                    pts.push(Point::new(x, y, z));
                }
            }
        }
        pts
    }

    /// Checks that the hull is a closed, consistently wound 2-manifold:
    /// every directed edge appears exactly once, and its reverse exists.
    fn assert_manifold(hull: &ConvexHull3) {
        let mut edges = HashSet::new();
        for face in hull.faces() {
            for e in 0..3 {
                let edge = (face[e], face[(e + 1) % 3]);
                assert!(edges.insert(edge), "duplicated directed edge {edge:?}");
            }
        }
        for &(a, b) in &edges {
            assert!(edges.contains(&(b, a)), "unmatched twin for edge ({a}, {b})");
        }
        // Euler characteristic of a sphere-topology triangulation.
        let v = hull.vertices().len();
        let f = hull.faces().len();
        let e = edges.len() / 2;
        assert_eq!(v + f, e + 2, "hull is not a closed 2-manifold");
    }

    #[test]
    fn cube_hull() {
        let pts = cube_points();
        let hull = ConvexHull3::try_new(&pts, 1.0e-6).unwrap();
        assert_eq!(hull.vertices().len(), 8);
        assert_manifold(&hull);
        for p in &pts {
            assert!(hull.contains_point(p, 1.0e-4));
        }
    }

    #[test]
    fn interior_points_are_discarded() {
        let mut pts = cube_points();
        pts.push(Point::new(0.0, 0.0, 0.0));
        pts.push(Point::new(0.5, -0.25, 0.125));
        let hull = ConvexHull3::try_new(&pts, 1.0e-6).unwrap();
        assert_eq!(hull.vertices().len(), 8);
        assert_manifold(&hull);
    }

    #[test]
    fn random_like_cloud_is_contained() {
        // Deterministic scattered cloud from a simple recurrence.
        let mut pts = Vec::new();
        let mut x: u64 = 0x243F6A8885A308D3;
        let mut sample = || {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((x >> 33) as f64 / (1u64 << 31) as f64 - 1.0) as Real
        };
        for _ in 0..200 {
            pts.push(Point::new(sample(), sample() * 0.5, sample() * 2.0));
        }

        let hull = ConvexHull3::try_new(&pts, 1.0e-6).unwrap();
        assert_manifold(&hull);
        for p in &pts {
            assert!(hull.contains_point(p, 1.0e-3));
        }
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        // Too few points.
        let pts = vec![Point::new(0.0, 0.0, 0.0); 3];
        assert!(matches!(
            ConvexHull3::try_new(&pts, 1.0e-6),
            Err(Error::DegenerateGeometry(_))
        ));

        // Coincident.
        let pts = vec![Point::new(1.0, 2.0, 3.0); 16];
        assert!(matches!(
            ConvexHull3::try_new(&pts, 1.0e-6),
            Err(Error::DegenerateGeometry(_))
        ));

        // Colinear.
        let pts: Vec<_> = (0..16)
            .map(|i| Point::new(i as Real, 2.0 * i as Real, 0.0))
            .collect();
        assert!(matches!(
            ConvexHull3::try_new(&pts, 1.0e-6),
            Err(Error::DegenerateGeometry(_))
        ));

        // Coplanar.
        let mut pts = Vec::new();
        for x in 0..4 {
            for y in 0..4 {
                pts.push(Point::new(x as Real, y as Real, 0.0));
            }
        }
        assert!(matches!(
            ConvexHull3::try_new(&pts, 1.0e-6),
            Err(Error::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn support_point_is_extreme() {
        let hull = ConvexHull3::try_new(&cube_points(), 1.0e-6).unwrap();
        let s = hull.support_point(&Vector::new(1.0, 1.0, 1.0));
        assert_eq!(s, Point::new(1.0, 1.0, 1.0));
    }
}
