//! CART decision tree used as the forest's base learner.

use ndarray::{ArrayView1, ArrayView2};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Growth limits for a single tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Maximum depth. `None` grows until leaves are pure.
    pub max_depth: Option<usize>,
    /// Minimum samples a node needs before it may split.
    pub min_samples_split: usize,
    /// Candidate features evaluated at each split.
    pub max_features: usize,
}

/// A node of a fitted tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        class: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A fitted classification tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    root: Node,
}

impl DecisionTree {
    /// Grows a tree on the given rows using Gini impurity.
    ///
    /// `labels` holds class indices below `n_classes`. `rows` may repeat
    /// indices (bootstrap samples).
    pub fn fit<R: Rng>(
        features: ArrayView2<'_, f64>,
        labels: &[usize],
        n_classes: usize,
        rows: &[usize],
        params: &TreeParams,
        rng: &mut R,
    ) -> Self {
        let builder = Builder {
            features,
            labels,
            n_classes,
            params,
        };
        Self {
            root: builder.grow(rows.to_vec(), 0, rng),
        }
    }

    /// Predicts the class index of one row.
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> usize {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { class } => return *class,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    /// Returns the root node.
    pub const fn root(&self) -> &Node {
        &self.root
    }
}

struct Builder<'f, 'a> {
    features: ArrayView2<'f, f64>,
    labels: &'a [usize],
    n_classes: usize,
    params: &'a TreeParams,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl Builder<'_, '_> {
    fn grow<R: Rng>(&self, rows: Vec<usize>, depth: usize, rng: &mut R) -> Node {
        let counts = self.class_counts(&rows);
        let majority = majority_class(&counts);

        let pure = counts.iter().filter(|&&count| count > 0).count() <= 1;
        let too_small = rows.len() < self.params.min_samples_split.max(2);
        let too_deep = self.params.max_depth.is_some_and(|max| depth >= max);
        if pure || too_small || too_deep {
            return Node::Leaf { class: majority };
        }

        let Some(best) = self.best_split(&rows, &counts, rng) else {
            return Node::Leaf { class: majority };
        };

        let (left, right): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&row| self.features[[row, best.feature]] <= best.threshold);

        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: Box::new(self.grow(left, depth + 1, rng)),
            right: Box::new(self.grow(right, depth + 1, rng)),
        }
    }

    fn class_counts(&self, rows: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.n_classes];
        for &row in rows {
            counts[self.labels[row]] += 1;
        }
        counts
    }

    fn best_split<R: Rng>(&self, rows: &[usize], counts: &[usize], rng: &mut R) -> Option<BestSplit> {
        let n_features = self.features.ncols();
        let mut candidates: Vec<usize> = (0..n_features).collect();
        candidates.shuffle(rng);
        candidates.truncate(self.params.max_features.clamp(1, n_features));

        let parent_impurity = gini(counts, rows.len());
        let mut best: Option<BestSplit> = None;

        for feature in candidates {
            let mut sorted: Vec<(f64, usize)> = rows
                .iter()
                .map(|&row| (self.features[[row, feature]], self.labels[row]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_counts = vec![0; self.n_classes];
            let mut right_counts = counts.to_vec();

            for position in 0..sorted.len() - 1 {
                let (value, class) = sorted[position];
                left_counts[class] += 1;
                right_counts[class] -= 1;

                let next_value = sorted[position + 1].0;
                if next_value <= value {
                    continue;
                }

                let left_len = position + 1;
                let right_len = sorted.len() - left_len;
                let impurity = (left_len as f64 * gini(&left_counts, left_len)
                    + right_len as f64 * gini(&right_counts, right_len))
                    / sorted.len() as f64;

                if impurity < parent_impurity
                    && best.as_ref().is_none_or(|current| impurity < current.impurity)
                {
                    best = Some(BestSplit {
                        feature,
                        threshold: value + (next_value - value) / 2.0,
                        impurity,
                    });
                }
            }
        }

        best
    }
}

/// Gini impurity of a class histogram.
fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|&count| {
            let share = count as f64 / total;
            share * share
        })
        .sum::<f64>()
}

/// Most frequent class; ties go to the lowest index.
pub(crate) fn majority_class(counts: &[usize]) -> usize {
    counts
        .iter()
        .enumerate()
        .fold((0, 0), |(best, best_count), (class, &count)| {
            if count > best_count {
                (class, count)
            } else {
                (best, best_count)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    const PARAMS: TreeParams = TreeParams {
        max_depth: None,
        min_samples_split: 2,
        max_features: 2,
    };

    #[test]
    fn test_tree_separates_linearly_separable_data() {
        let features = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [10.0, 5.0], [11.0, 5.0]];
        let labels = [0, 0, 0, 1, 1];
        let rows: Vec<usize> = (0..5).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let tree = DecisionTree::fit(features.view(), &labels, 2, &rows, &PARAMS, &mut rng);

        for (row, &label) in labels.iter().enumerate() {
            assert_eq!(tree.predict_row(features.row(row)), label);
        }
        let Node::Split { feature, .. } = tree.root() else {
            panic!("expected a split at the root");
        };
        assert_eq!(*feature, 0);
    }

    #[test]
    fn test_tree_with_identical_features_is_a_leaf() {
        let features = array![[1.0], [1.0], [1.0]];
        let labels = [1, 0, 1];
        let rows: Vec<usize> = (0..3).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let tree = DecisionTree::fit(features.view(), &labels, 2, &rows, &PARAMS, &mut rng);
        assert_eq!(tree.root(), &Node::Leaf { class: 1 });
    }

    #[test]
    fn test_max_depth_limits_growth() {
        let features = array![[0.0], [1.0], [2.0], [3.0]];
        let labels = [0, 1, 0, 1];
        let rows: Vec<usize> = (0..4).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let params = TreeParams {
            max_depth: Some(0),
            ..PARAMS
        };

        let tree = DecisionTree::fit(features.view(), &labels, 2, &rows, &params, &mut rng);
        assert!(matches!(tree.root(), Node::Leaf { .. }));
    }

    #[test]
    fn test_fit_borrows_labels_shorter_than_features() {
        let features = array![[0.0], [0.5], [9.0], [9.5]];
        let view = features.view();
        let mut rng = StdRng::seed_from_u64(3);

        let tree = {
            let labels = vec![0, 0, 1, 1];
            let rows: Vec<usize> = (0..labels.len()).collect();
            let params = TreeParams {
                max_features: 1,
                ..PARAMS
            };
            DecisionTree::fit(view, &labels, 2, &rows, &params, &mut rng)
        };

        assert_eq!(tree.predict_row(view.row(0)), 0);
        assert_eq!(tree.predict_row(view.row(3)), 1);
    }

    #[test]
    fn test_majority_class_breaks_ties_low() {
        assert_eq!(majority_class(&[2, 2, 1]), 0);
        assert_eq!(majority_class(&[0, 3, 3]), 1);
        assert_eq!(majority_class(&[0, 0, 0]), 0);
    }

    #[test]
    fn test_gini() {
        assert!(gini(&[4, 0], 4).abs() < f64::EPSILON);
        assert!((gini(&[2, 2], 4) - 0.5).abs() < f64::EPSILON);
    }
}
