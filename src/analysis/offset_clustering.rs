use std::collections::{HashMap, VecDeque};

use crate::analysis::{cancel::CancelToken, matcher::CandidateMatch};

/// Candidate matches sharing one dense region of offset space.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCluster {
    pub id: usize,
    /// Indices into the clustered match list, ascending.
    pub members: Vec<usize>,
    /// Mean `(dx, dy)` of the members.
    pub mean_offset: (f64, f64),
}

impl OffsetCluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Cluster(usize),
}

/// DBSCAN over match offset vectors.
///
/// A match is core when at least `min_pts` other matches lie within `eps` of
/// its offset. Matches with identical offsets are folded into one weighted
/// point first; they share a neighbourhood, so labels are unchanged while
/// dense translations cost one range query instead of one per match.
pub struct OffsetClusterer {
    eps: f64,
    min_pts: usize,
}

struct OffsetGrid {
    cell: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl OffsetGrid {
    fn new(points: &[(f64, f64)], cell: f64) -> Self {
        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (i, &p) in points.iter().enumerate() {
            cells.entry(Self::key(p, cell)).or_default().push(i);
        }
        Self { cell, cells }
    }

    fn key((x, y): (f64, f64), cell: f64) -> (i64, i64) {
        ((x / cell).floor() as i64, (y / cell).floor() as i64)
    }

    /// Every point within `eps` of `points[i]`, including `i`, ascending.
    fn range(&self, points: &[(f64, f64)], i: usize, eps: f64) -> Vec<usize> {
        let (px, py) = points[i];
        let (cx, cy) = Self::key(points[i], self.cell);
        let eps_sq = eps * eps;
        let mut found = Vec::new();

        // Keys saturate for radii far below the offset scale.
        for gy in cy.saturating_sub(1)..=cy.saturating_add(1) {
            for gx in cx.saturating_sub(1)..=cx.saturating_add(1) {
                let Some(bucket) = self.cells.get(&(gx, gy)) else {
                    continue;
                };
                found.extend(bucket.iter().copied().filter(|&j| {
                    let (qx, qy) = points[j];
                    (px - qx).powi(2) + (py - qy).powi(2) <= eps_sq
                }));
            }
        }

        found.sort_unstable();
        found
    }
}

impl OffsetClusterer {
    pub fn new(eps: f64, min_pts: usize) -> Self {
        Self { eps, min_pts }
    }

    /// Clusters `matches` by offset. Noise matches appear in no cluster.
    /// Returns `None` only when cancelled.
    pub fn cluster(&self, matches: &[CandidateMatch], cancel: &CancelToken) -> Option<Vec<OffsetCluster>> {
        let offsets = matches
            .iter()
            .map(|m| (m.offset.0 as f64, m.offset.1 as f64))
            .collect::<Vec<_>>();
        self.cluster_points(&offsets, cancel)
    }

    pub fn cluster_points(&self, offsets: &[(f64, f64)], cancel: &CancelToken) -> Option<Vec<OffsetCluster>> {
        if offsets.is_empty() {
            return Some(Vec::new());
        }

        // Fold identical offsets, keeping first-occurrence order.
        let mut unique_index: HashMap<(u64, u64), usize> = HashMap::new();
        let mut unique = Vec::new();
        let mut owners: Vec<Vec<usize>> = Vec::new();
        for (i, &(x, y)) in offsets.iter().enumerate() {
            let slot = *unique_index.entry((x.to_bits(), y.to_bits())).or_insert_with(|| {
                unique.push((x, y));
                owners.push(Vec::new());
                unique.len() - 1
            });
            owners[slot].push(i);
        }

        let grid = OffsetGrid::new(&unique, self.eps);
        let weight = |u: usize| owners[u].len();
        let region = |u: usize| grid.range(&unique, u, self.eps);
        let is_core = |neighbors: &[usize]| {
            neighbors.iter().map(|&v| weight(v)).sum::<usize>().saturating_sub(1) >= self.min_pts
        };

        let mut labels = vec![Label::Unvisited; unique.len()];
        let mut next_id = 0;

        for u in 0..unique.len() {
            if cancel.is_cancelled() {
                return None;
            }
            if labels[u] != Label::Unvisited {
                continue;
            }

            let neighbors = region(u);
            if !is_core(&neighbors) {
                labels[u] = Label::Noise;
                continue;
            }

            let id = next_id;
            next_id += 1;
            labels[u] = Label::Cluster(id);

            let mut queue = neighbors.into_iter().collect::<VecDeque<_>>();
            while let Some(v) = queue.pop_front() {
                match labels[v] {
                    Label::Noise => {
                        labels[v] = Label::Cluster(id);
                        continue;
                    }
                    Label::Cluster(_) => continue,
                    Label::Unvisited => {}
                }

                labels[v] = Label::Cluster(id);
                let expansion = region(v);
                if is_core(&expansion) {
                    queue.extend(
                        expansion
                            .into_iter()
                            .filter(|&w| matches!(labels[w], Label::Unvisited | Label::Noise)),
                    );
                }
            }
        }

        let mut clusters = (0..next_id)
            .map(|id| OffsetCluster {
                id,
                members: Vec::new(),
                mean_offset: (0.0, 0.0),
            })
            .collect::<Vec<_>>();

        for (u, label) in labels.iter().enumerate() {
            if let Label::Cluster(id) = *label {
                clusters[id].members.extend_from_slice(&owners[u]);
            }
        }

        for cluster in &mut clusters {
            cluster.members.sort_unstable();
            let n = cluster.members.len() as f64;
            let (sx, sy) = cluster
                .members
                .iter()
                .fold((0.0, 0.0), |(sx, sy), &i| (sx + offsets[i].0, sy + offsets[i].1));
            cluster.mean_offset = (sx / n, sy / n);
        }

        Some(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jittered(center: (f64, f64), count: usize) -> Vec<(f64, f64)> {
        (0..count)
            .map(|i| {
                let jx = (i % 3) as f64 - 1.0;
                let jy = ((i / 3) % 3) as f64 - 1.0;
                (center.0 + jx, center.1 + jy)
            })
            .collect()
    }

    #[test]
    fn test_two_distant_groups_stay_separate() {
        let mut points = jittered((60.0, 40.0), 30);
        points.extend(jittered((60.0, 52.0), 30));
        let clusters = OffsetClusterer::new(5.0, 20)
            .cluster_points(&points, &CancelToken::new())
            .unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, (0..30).collect::<Vec<_>>());
        assert_eq!(clusters[1].members, (30..60).collect::<Vec<_>>());
        assert!((clusters[0].mean_offset.1 - 40.0).abs() < 1.0);
    }

    #[test]
    fn test_sparse_offsets_are_noise() {
        let points = (0..50)
            .map(|i| ((i * 37 % 200) as f64, (i * 91 % 200) as f64))
            .collect::<Vec<_>>();
        let clusters = OffsetClusterer::new(5.0, 20)
            .cluster_points(&points, &CancelToken::new())
            .unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_min_pts_excludes_self() {
        let points = vec![(10.0, 10.0); 20];
        let clusterer = OffsetClusterer::new(1.0, 20);
        assert!(clusterer.cluster_points(&points, &CancelToken::new()).unwrap().is_empty());

        let points = vec![(10.0, 10.0); 21];
        let clusters = clusterer.cluster_points(&points, &CancelToken::new()).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 21);
    }

    #[test]
    fn test_border_point_joins_cluster() {
        let mut points = vec![(0.0, 0.0); 25];
        points.push((4.5, 0.0));
        points.push((9.0, 0.0));
        points.push((50.0, 0.0));
        let clusters = OffsetClusterer::new(5.0, 20)
            .cluster_points(&points, &CancelToken::new())
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].members.contains(&26));
        assert!(!clusters[0].members.contains(&27));
    }

    #[test]
    fn test_ids_follow_discovery_order() {
        let mut points = vec![(-80.0, 0.0); 22];
        points.extend(vec![(80.0, 0.0); 22]);
        let clusters = OffsetClusterer::new(3.0, 20)
            .cluster_points(&points, &CancelToken::new())
            .unwrap();
        assert_eq!(clusters[0].id, 0);
        assert_eq!(clusters[0].members[0], 0);
        assert_eq!(clusters[1].members[0], 22);
    }

    #[test]
    fn test_vanishing_eps_keeps_exact_groups() {
        let mut points = vec![(60.0, 40.0); 3];
        points.extend(vec![(-60.0, -40.0); 3]);
        points.push((61.0, 40.0));
        let clusters = OffsetClusterer::new(1e-20, 2)
            .cluster_points(&points, &CancelToken::new())
            .unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1, 2]);
        assert_eq!(clusters[1].members, vec![3, 4, 5]);
    }
}
