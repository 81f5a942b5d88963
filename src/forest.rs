use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Hyperparameters of one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    left_len: usize,
    weighted_impurity: f64,
}

fn gini(positives: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = positives as f64 / total as f64;
    2.0 * p * (1.0 - p)
}

/// A CART classification tree over integer count features.
#[derive(Debug, Clone)]
pub struct DecisionTree {
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl DecisionTree {
    /// Grow a tree on `sample` (row indices into `x`, repeats allowed).
    fn fit(
        x: &[Vec<u32>],
        y: &[bool],
        sample: &mut [usize],
        params: &ForestParams,
        n_features: usize,
        rng: &mut StdRng,
    ) -> Self {
        let mut tree = DecisionTree {
            nodes: Vec::new(),
            importances: vec![0.0; n_features],
        };
        tree.grow(x, y, sample, 0, params, rng);

        let total: f64 = tree.importances.iter().sum();
        if total > 0.0 {
            tree.importances.iter_mut().for_each(|v| *v /= total);
        }
        tree
    }

    fn grow(
        &mut self,
        x: &[Vec<u32>],
        y: &[bool],
        sample: &mut [usize],
        depth: usize,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> usize {
        let n = sample.len();
        let positives = sample.iter().filter(|&&i| y[i]).count();
        let node_index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            probability: positives as f64 / n as f64,
        });

        let pure = positives == 0 || positives == n;
        if pure || depth >= params.max_depth || n < 2 * params.min_samples_leaf.max(1) {
            return node_index;
        }

        let Some(best) = self.best_split(x, y, sample, params, rng) else {
            return node_index;
        };

        sample.sort_by_key(|&i| x[i][best.feature]);
        let left_positives = sample[..best.left_len].iter().filter(|&&i| y[i]).count();
        let right_len = n - best.left_len;
        let decrease = n as f64 * gini(positives, n)
            - best.left_len as f64 * gini(left_positives, best.left_len)
            - right_len as f64 * gini(positives - left_positives, right_len);
        self.importances[best.feature] += decrease.max(0.0);

        let (left_sample, right_sample) = sample.split_at_mut(best.left_len);
        let left = self.grow(x, y, left_sample, depth + 1, params, rng);
        let right = self.grow(x, y, right_sample, depth + 1, params, rng);
        self.nodes[node_index] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        node_index
    }

    fn best_split(
        &self,
        x: &[Vec<u32>],
        y: &[bool],
        sample: &mut [usize],
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> Option<BestSplit> {
        let n = sample.len();
        let n_features = self.importances.len();
        let max_features = ((n_features as f64).sqrt().floor() as usize).max(1);
        let min_leaf = params.min_samples_leaf.max(1);
        let total_positives = sample.iter().filter(|&&i| y[i]).count();

        let mut candidates: Vec<usize> = (0..n_features).collect();
        candidates.shuffle(rng);

        // Constant features are skipped without using up the max_features draw
        let mut visited = 0;
        let mut best: Option<BestSplit> = None;
        for feature in candidates {
            if visited == max_features {
                break;
            }
            sample.sort_by_key(|&i| x[i][feature]);
            if x[sample[0]][feature] == x[sample[n - 1]][feature] {
                continue;
            }
            visited += 1;

            let mut left_positives = 0;
            for pos in 0..n - 1 {
                if y[sample[pos]] {
                    left_positives += 1;
                }
                let here = x[sample[pos]][feature];
                let next = x[sample[pos + 1]][feature];
                if here == next {
                    continue;
                }
                let left_len = pos + 1;
                let right_len = n - left_len;
                if left_len < min_leaf || right_len < min_leaf {
                    continue;
                }

                let weighted_impurity = left_len as f64 * gini(left_positives, left_len)
                    + right_len as f64 * gini(total_positives - left_positives, right_len);
                if best
                    .as_ref()
                    .map_or(true, |b| weighted_impurity < b.weighted_impurity)
                {
                    best = Some(BestSplit {
                        feature,
                        threshold: (f64::from(here) + f64::from(next)) / 2.0,
                        left_len,
                        weighted_impurity,
                    });
                }
            }
        }
        best
    }

    pub fn predict_proba(&self, row: &[u32]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { probability } => return *probability,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if f64::from(row[*feature]) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Bagged ensemble of [`DecisionTree`]s.
#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
}

/// Per-tree seed; trees never share a random stream, so fitting order and
/// worker count do not change the result.
fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

impl RandomForest {
    /// Fit on the rows listed in `rows`. Trees are grown in parallel on the
    /// current rayon pool.
    pub fn fit(
        x: &[Vec<u32>],
        y: &[bool],
        rows: &[usize],
        params: &ForestParams,
        seed: u64,
    ) -> Result<Self> {
        if rows.is_empty() {
            anyhow::bail!("Cannot fit a forest on zero rows");
        }
        if params.n_estimators == 0 {
            anyhow::bail!("A forest needs at least one tree");
        }
        let n_features = x[rows[0]].len();

        let trees: Vec<DecisionTree> = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(seed, t));
                let mut sample: Vec<usize> = (0..rows.len())
                    .map(|_| rows[rng.gen_range(0..rows.len())])
                    .collect();
                DecisionTree::fit(x, y, &mut sample, params, n_features, &mut rng)
            })
            .collect();

        Ok(Self { trees, n_features })
    }

    pub fn predict_proba(&self, row: &[u32]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.predict_proba(row)).sum();
        total / self.trees.len() as f64
    }

    pub fn predict(&self, row: &[u32]) -> bool {
        self.predict_proba(row) > 0.5
    }

    /// Mean decrease in impurity per feature, summing to 1 unless no tree
    /// ever split.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut importances = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (acc, value) in importances.iter_mut().zip(&tree.importances) {
                *acc += value;
            }
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        importances
    }

    #[cfg(test)]
    fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Feature 0 decides the label; feature 1 is noise.
    fn separable() -> (Vec<Vec<u32>>, Vec<bool>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..60u32 {
            let signal = i % 4;
            x.push(vec![signal, (i * 7) % 3]);
            y.push(signal >= 2);
        }
        (x, y)
    }

    fn params() -> ForestParams {
        ForestParams {
            n_estimators: 25,
            max_depth: 10,
            min_samples_leaf: 1,
        }
    }

    #[test]
    fn learns_a_separable_rule() {
        let (x, y) = separable();
        let rows: Vec<usize> = (0..x.len()).collect();
        let forest = RandomForest::fit(&x, &y, &rows, &params(), 11).unwrap();
        assert!(forest.predict(&[3, 0]));
        assert!(!forest.predict(&[0, 2]));
        assert_eq!(forest.trees().len(), 25);
    }

    #[test]
    fn signal_feature_dominates_importance() {
        let (x, y) = separable();
        let rows: Vec<usize> = (0..x.len()).collect();
        let forest = RandomForest::fit(&x, &y, &rows, &params(), 11).unwrap();
        let importances = forest.feature_importances();
        assert!((importances.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn same_seed_same_forest_regardless_of_pool() {
        let (x, y) = separable();
        let rows: Vec<usize> = (0..x.len()).collect();
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| RandomForest::fit(&x, &y, &rows, &params(), 7).unwrap());
        let multi = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap()
            .install(|| RandomForest::fit(&x, &y, &rows, &params(), 7).unwrap());
        assert_eq!(single.feature_importances(), multi.feature_importances());
    }

    #[test]
    fn single_class_makes_stumps_with_no_importance() {
        let x = vec![vec![1, 2], vec![3, 4], vec![0, 0]];
        let y = vec![false, false, false];
        let forest = RandomForest::fit(&x, &y, &[0, 1, 2], &params(), 1).unwrap();
        assert!(forest.trees().iter().all(|t| t.node_count() == 1));
        assert_eq!(forest.feature_importances(), vec![0.0, 0.0]);
        assert!(!forest.predict(&[1, 2]));
    }

    #[test]
    fn min_samples_leaf_limits_growth() {
        let (x, y) = separable();
        let rows: Vec<usize> = (0..x.len()).collect();
        let coarse = ForestParams {
            min_samples_leaf: 100,
            ..params()
        };
        let forest = RandomForest::fit(&x, &y, &rows, &coarse, 3).unwrap();
        assert!(forest.trees().iter().all(|t| t.node_count() == 1));
    }

    #[test]
    fn refuses_empty_input() {
        let x: Vec<Vec<u32>> = Vec::new();
        assert!(RandomForest::fit(&x, &[], &[], &params(), 1).is_err());
    }
}
