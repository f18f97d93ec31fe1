//! A static 3-D KD-tree over unit vectors.
//!
//! Nodes live in a flat vector; leaves hold ranges into the reordered point
//! array. Searches report squared chord lengths, and equal distances always
//! resolve to the smaller original index so results do not depend on tree
//! layout.

const LEAF_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub index: usize,
    pub dist_sq: f64,
}

impl Hit {
    /// Total order on (distance, index).
    fn better_than(&self, other: &Hit) -> bool {
        match self.dist_sq.total_cmp(&other.dist_sq) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.index < other.index,
            std::cmp::Ordering::Greater => false,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        axis: usize,
        value: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        start: usize,
        end: usize,
    },
}

#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<Node>,
    points: Vec<[f64; 3]>,
    indices: Vec<usize>,
}

fn dist_sq(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

impl KdTree {
    pub fn build(points: &[[f64; 3]]) -> Self {
        let mut entries: Vec<([f64; 3], usize)> =
            points.iter().copied().zip(0..points.len()).collect();
        let mut nodes = Vec::new();
        if !entries.is_empty() {
            let n = entries.len();
            Self::split(&mut nodes, &mut entries, 0, n);
        }
        let (points, indices) = entries.into_iter().unzip();
        KdTree {
            nodes,
            points,
            indices,
        }
    }

    fn widest_axis(entries: &[([f64; 3], usize)]) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for axis in 0..3 {
            let (lo, hi) = entries.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), e| {
                (lo.min(e.0[axis]), hi.max(e.0[axis]))
            });
            if hi - lo > best.1 {
                best = (axis, hi - lo);
            }
        }
        best.0
    }

    fn split(nodes: &mut Vec<Node>, entries: &mut [([f64; 3], usize)], start: usize, end: usize) -> usize {
        let id = nodes.len();
        if end - start <= LEAF_SIZE {
            nodes.push(Node::Leaf { start, end });
            return id;
        }
        let slice = &mut entries[start..end];
        let axis = Self::widest_axis(slice);
        let mid = slice.len() / 2;
        slice.select_nth_unstable_by(mid, |a, b| a.0[axis].total_cmp(&b.0[axis]));
        let value = slice[mid].0[axis];

        // placeholder until both children exist
        nodes.push(Node::Leaf { start: 0, end: 0 });
        let left = Self::split(nodes, entries, start, start + mid);
        let right = Self::split(nodes, entries, start + mid, end);
        nodes[id] = Node::Split {
            axis,
            value,
            left,
            right,
        };
        id
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Nearest point to `query`; `None` on an empty tree.
    pub fn nearest(&self, query: &[f64; 3]) -> Option<Hit> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut best = Hit {
            index: usize::MAX,
            dist_sq: f64::INFINITY,
        };
        self.nearest_in(0, query, &mut best);
        Some(best)
    }

    fn nearest_in(&self, node: usize, query: &[f64; 3], best: &mut Hit) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for i in start..end {
                    let hit = Hit {
                        index: self.indices[i],
                        dist_sq: dist_sq(query, &self.points[i]),
                    };
                    if hit.better_than(best) {
                        *best = hit;
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (near, far) = if diff <= 0.0 { (left, right) } else { (right, left) };
                self.nearest_in(near, query, best);
                // `<=` so that an equidistant point with a smaller index is still seen
                if diff * diff <= best.dist_sq {
                    self.nearest_in(far, query, best);
                }
            }
        }
    }

    /// All points within squared chord `radius_sq`, sorted by distance then
    /// index.
    pub fn within(&self, query: &[f64; 3], radius_sq: f64) -> Vec<Hit> {
        let mut hits = Vec::new();
        if !self.nodes.is_empty() {
            self.within_in(0, query, radius_sq, &mut hits);
        }
        hits.sort_by(|a, b| a.dist_sq.total_cmp(&b.dist_sq).then(a.index.cmp(&b.index)));
        hits
    }

    fn within_in(&self, node: usize, query: &[f64; 3], radius_sq: f64, hits: &mut Vec<Hit>) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                hits.extend((start..end).filter_map(|i| {
                    let d = dist_sq(query, &self.points[i]);
                    (d <= radius_sq).then_some(Hit {
                        index: self.indices[i],
                        dist_sq: d,
                    })
                }));
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (near, far) = if diff <= 0.0 { (left, right) } else { (right, left) };
                self.within_in(near, query, radius_sq, hits);
                if diff * diff <= radius_sq {
                    self.within_in(far, query, radius_sq, hits);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<[f64; 3]> {
        (0..n)
            .map(|i| {
                let t = i as f64 * 0.37;
                [t.cos(), t.sin(), (i % 7) as f64 * 0.1]
            })
            .collect()
    }

    #[test]
    fn test_nearest_matches_linear_scan() {
        let points = grid(200);
        let tree = KdTree::build(&points);
        assert_eq!(tree.len(), 200);
        for q in [[0.1, 0.2, 0.3], [-1.0, 0.0, 0.5], [0.7, -0.7, 0.0]] {
            let hit = tree.nearest(&q).unwrap();
            let (idx, d) = points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, dist_sq(&q, p)))
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
                .unwrap();
            assert_eq!(hit.index, idx);
            assert_eq!(hit.dist_sq, d);
        }
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        let p = [0.0, 0.0, 1.0];
        let points = vec![p; 40];
        let tree = KdTree::build(&points);
        assert_eq!(tree.nearest(&[0.0, 0.1, 1.0]).unwrap().index, 0);
        let hits = tree.within(&p, 1e-12);
        assert_eq!(hits.len(), 40);
        assert!(hits.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.nearest(&[1.0, 0.0, 0.0]).is_none());
        assert!(tree.within(&[1.0, 0.0, 0.0], 1.0).is_empty());
    }
}
