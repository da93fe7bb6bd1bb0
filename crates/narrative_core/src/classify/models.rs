//! Configured classifiers and the linfa models behind them.

use crate::error::{FitError, FitResult};
use linfa::traits::{Fit, Predict};
use linfa::Dataset;
use linfa_bayes::{GaussianNb, MultinomialNb};
use linfa_elasticnet::ElasticNet;
use linfa_logistic::{FittedLogisticRegression, LogisticRegression};
use linfa_nn::distance::L2Dist;
use linfa_nn::{LinearSearch, NearestNeighbour};
use linfa_svm::Svm;
use linfa_trees::DecisionTree;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// One configured entry of the bench: a display name plus an algorithm with
/// its hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSpec {
    pub name: String,
    #[serde(flatten)]
    pub algorithm: Algorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SvmKernel {
    Linear,
    Gaussian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    MultinomialNb {
        #[serde(default = "default_alphas")]
        alphas: Vec<f64>,
    },
    GaussianNb {
        #[serde(default = "default_var_smoothing")]
        var_smoothing: Vec<f64>,
    },
    LogisticRegression {
        #[serde(default = "default_l2_alphas")]
        alphas: Vec<f64>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u64,
    },
    Svm {
        kernel: SvmKernel,
        #[serde(default = "default_c_values")]
        c_values: Vec<f64>,
        #[serde(default = "default_kernel_width")]
        kernel_width: f64,
    },
    /// Least squares on ±1 targets; `l1_ratio` 0 is ridge, 1 is lasso.
    ElasticNet {
        l1_ratio: f64,
        #[serde(default = "default_penalties")]
        penalties: Vec<f64>,
    },
    Knn {
        #[serde(default = "default_k_values")]
        k_values: Vec<usize>,
    },
    DecisionTree {
        #[serde(default = "default_max_depths")]
        max_depths: Vec<usize>,
    },
}

fn default_alphas() -> Vec<f64> {
    vec![0.1, 0.5, 1.0]
}

fn default_var_smoothing() -> Vec<f64> {
    vec![1e-9, 1e-6, 1e-3]
}

fn default_l2_alphas() -> Vec<f64> {
    vec![0.01, 0.1, 1.0]
}

fn default_max_iterations() -> u64 {
    100
}

fn default_c_values() -> Vec<f64> {
    vec![0.1, 1.0, 10.0]
}

fn default_kernel_width() -> f64 {
    1.0
}

fn default_penalties() -> Vec<f64> {
    vec![0.001, 0.01, 0.1]
}

fn default_k_values() -> Vec<usize> {
    vec![3, 5, 9, 15]
}

fn default_max_depths() -> Vec<usize> {
    vec![5, 10, 20]
}

impl ClassifierSpec {
    fn new(name: &str, algorithm: Algorithm) -> Self {
        Self {
            name: name.to_string(),
            algorithm,
        }
    }

    pub fn default_bench() -> Vec<Self> {
        vec![
            Self::new("multinomial_nb", Algorithm::MultinomialNb { alphas: default_alphas() }),
            Self::new(
                "gaussian_nb",
                Algorithm::GaussianNb {
                    var_smoothing: default_var_smoothing(),
                },
            ),
            Self::new(
                "logistic_regression",
                Algorithm::LogisticRegression {
                    alphas: default_l2_alphas(),
                    max_iterations: default_max_iterations(),
                },
            ),
            Self::new(
                "linear_svm",
                Algorithm::Svm {
                    kernel: SvmKernel::Linear,
                    c_values: default_c_values(),
                    kernel_width: default_kernel_width(),
                },
            ),
            Self::new(
                "rbf_svm",
                Algorithm::Svm {
                    kernel: SvmKernel::Gaussian,
                    c_values: vec![1.0, 10.0],
                    kernel_width: default_kernel_width(),
                },
            ),
            Self::new(
                "ridge",
                Algorithm::ElasticNet {
                    l1_ratio: 0.0,
                    penalties: default_penalties(),
                },
            ),
            Self::new(
                "lasso",
                Algorithm::ElasticNet {
                    l1_ratio: 1.0,
                    penalties: vec![0.0001, 0.001, 0.01],
                },
            ),
            Self::new(
                "elastic_net",
                Algorithm::ElasticNet {
                    l1_ratio: 0.5,
                    penalties: vec![0.0001, 0.001, 0.01],
                },
            ),
            Self::new("knn", Algorithm::Knn { k_values: default_k_values() }),
            Self::new(
                "decision_tree",
                Algorithm::DecisionTree {
                    max_depths: default_max_depths(),
                },
            ),
        ]
    }
}

impl Algorithm {
    pub fn kind(&self) -> &'static str {
        match self {
            Algorithm::MultinomialNb { .. } => "multinomial_nb",
            Algorithm::GaussianNb { .. } => "gaussian_nb",
            Algorithm::LogisticRegression { .. } => "logistic_regression",
            Algorithm::Svm { .. } => "svm",
            Algorithm::ElasticNet { .. } => "elastic_net",
            Algorithm::Knn { .. } => "knn",
            Algorithm::DecisionTree { .. } => "decision_tree",
        }
    }

    /// Every hyperparameter setting to try, in configured order.
    pub fn grid(&self) -> Vec<Candidate> {
        match self {
            Algorithm::MultinomialNb { alphas } => {
                alphas.iter().map(|&alpha| Candidate::MultinomialNb { alpha }).collect()
            }
            Algorithm::GaussianNb { var_smoothing } => var_smoothing
                .iter()
                .map(|&var_smoothing| Candidate::GaussianNb { var_smoothing })
                .collect(),
            Algorithm::LogisticRegression { alphas, max_iterations } => alphas
                .iter()
                .map(|&alpha| Candidate::Logistic {
                    alpha,
                    max_iterations: *max_iterations,
                })
                .collect(),
            Algorithm::Svm {
                kernel,
                c_values,
                kernel_width,
            } => c_values
                .iter()
                .map(|&c| Candidate::Svm {
                    kernel: *kernel,
                    c,
                    kernel_width: *kernel_width,
                })
                .collect(),
            Algorithm::ElasticNet { l1_ratio, penalties } => penalties
                .iter()
                .map(|&penalty| Candidate::ElasticNet {
                    l1_ratio: *l1_ratio,
                    penalty,
                })
                .collect(),
            Algorithm::Knn { k_values } => k_values.iter().map(|&k| Candidate::Knn { k }).collect(),
            Algorithm::DecisionTree { max_depths } => max_depths
                .iter()
                .map(|&max_depth| Candidate::DecisionTree { max_depth })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Candidate {
    MultinomialNb { alpha: f64 },
    GaussianNb { var_smoothing: f64 },
    Logistic { alpha: f64, max_iterations: u64 },
    Svm { kernel: SvmKernel, c: f64, kernel_width: f64 },
    ElasticNet { l1_ratio: f64, penalty: f64 },
    Knn { k: usize },
    DecisionTree { max_depth: usize },
}

fn positive(name: &str, value: f64) -> FitResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(FitError::Degenerate(format!("{name} must be positive, got {value}")))
    }
}

fn library<E: std::fmt::Display>(algorithm: &'static str) -> impl FnOnce(E) -> FitError {
    move |err| FitError::Library {
        algorithm,
        message: err.to_string(),
    }
}

/// `decline` is class 1.
fn class_targets(y: &[bool]) -> Array1<usize> {
    y.iter().map(|&v| usize::from(v)).collect()
}

impl Candidate {
    pub fn describe(&self) -> String {
        match self {
            Candidate::MultinomialNb { alpha } => format!("alpha={alpha}"),
            Candidate::GaussianNb { var_smoothing } => format!("var_smoothing={var_smoothing}"),
            Candidate::Logistic { alpha, max_iterations } => {
                format!("alpha={alpha}, max_iterations={max_iterations}")
            }
            Candidate::Svm {
                kernel: SvmKernel::Linear,
                c,
                ..
            } => format!("kernel=linear, C={c}"),
            Candidate::Svm {
                kernel: SvmKernel::Gaussian,
                c,
                kernel_width,
            } => format!("kernel=gaussian, C={c}, width={kernel_width}"),
            Candidate::ElasticNet { l1_ratio, penalty } => format!("penalty={penalty}, l1_ratio={l1_ratio}"),
            Candidate::Knn { k } => format!("k={k}"),
            Candidate::DecisionTree { max_depth } => format!("max_depth={max_depth}"),
        }
    }

    fn validate(&self) -> FitResult<()> {
        match *self {
            Candidate::MultinomialNb { alpha } => positive("smoothing alpha", alpha),
            Candidate::GaussianNb { var_smoothing } => {
                if var_smoothing >= 0.0 && var_smoothing.is_finite() {
                    Ok(())
                } else {
                    Err(FitError::Degenerate(format!(
                        "var_smoothing must be non-negative, got {var_smoothing}"
                    )))
                }
            }
            Candidate::Logistic { alpha, max_iterations } => {
                positive("L2 alpha", alpha)?;
                if max_iterations == 0 {
                    return Err(FitError::Degenerate("max_iterations must be positive".to_string()));
                }
                Ok(())
            }
            Candidate::Svm { c, kernel_width, .. } => {
                positive("C", c)?;
                positive("kernel width", kernel_width)
            }
            Candidate::ElasticNet { l1_ratio, penalty } => {
                positive("penalty", penalty)?;
                if (0.0..=1.0).contains(&l1_ratio) {
                    Ok(())
                } else {
                    Err(FitError::Degenerate(format!("l1_ratio must lie in [0, 1], got {l1_ratio}")))
                }
            }
            Candidate::Knn { k: 0 } => Err(FitError::Degenerate("k must be positive".to_string())),
            Candidate::DecisionTree { max_depth: 0 } => {
                Err(FitError::Degenerate("max_depth must be positive".to_string()))
            }
            Candidate::Knn { .. } | Candidate::DecisionTree { .. } => Ok(()),
        }
    }

    pub fn fit(&self, x: &Array2<f64>, y: &[bool]) -> FitResult<FittedClassifier> {
        if x.nrows() == 0 || x.nrows() != y.len() {
            return Err(FitError::Degenerate(format!(
                "{} rows for {} labels",
                x.nrows(),
                y.len()
            )));
        }
        let positives = y.iter().filter(|v| **v).count();
        if positives == 0 || positives == y.len() {
            return Err(FitError::Degenerate("training data holds a single class".to_string()));
        }
        self.validate()?;

        let classes = || Dataset::new(x.clone(), class_targets(y));
        let fitted = match *self {
            Candidate::MultinomialNb { alpha } => FittedClassifier::MultinomialNb(
                MultinomialNb::params()
                    .alpha(alpha)
                    .fit(&classes())
                    .map_err(library("multinomial_nb"))?,
            ),
            Candidate::GaussianNb { var_smoothing } => FittedClassifier::GaussianNb(
                GaussianNb::params()
                    .var_smoothing(var_smoothing)
                    .fit(&classes())
                    .map_err(library("gaussian_nb"))?,
            ),
            Candidate::Logistic { alpha, max_iterations } => FittedClassifier::Logistic(
                LogisticRegression::default()
                    .alpha(alpha)
                    .max_iterations(max_iterations)
                    .fit(&classes())
                    .map_err(library("logistic_regression"))?,
            ),
            Candidate::Svm {
                kernel,
                c,
                kernel_width,
            } => {
                let data = Dataset::new(x.clone(), Array1::from_vec(y.to_vec()));
                let params = Svm::<f64, bool>::params().pos_neg_weights(c, c);
                let params = match kernel {
                    SvmKernel::Linear => params.linear_kernel(),
                    SvmKernel::Gaussian => params.gaussian_kernel(kernel_width),
                };
                FittedClassifier::Svm(params.fit(&data).map_err(library("svm"))?)
            }
            Candidate::ElasticNet { l1_ratio, penalty } => {
                let signed: Array1<f64> = y.iter().map(|&v| if v { 1.0 } else { -1.0 }).collect();
                FittedClassifier::ElasticNet(
                    ElasticNet::params()
                        .penalty(penalty)
                        .l1_ratio(l1_ratio)
                        .fit(&Dataset::new(x.clone(), signed))
                        .map_err(library("elastic_net"))?,
                )
            }
            Candidate::Knn { k } => FittedClassifier::Neighbors {
                k,
                rows: x.clone(),
                labels: y.to_vec(),
            },
            Candidate::DecisionTree { max_depth } => FittedClassifier::DecisionTree(
                DecisionTree::params()
                    .max_depth(Some(max_depth))
                    .fit(&classes())
                    .map_err(library("decision_tree"))?,
            ),
        };
        Ok(fitted)
    }
}

/// A trained binary decision rule; `true` is the positive class.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "model", rename_all = "snake_case")]
pub enum FittedClassifier {
    MultinomialNb(MultinomialNb<f64, usize>),
    GaussianNb(GaussianNb<f64, usize>),
    Logistic(FittedLogisticRegression<f64, usize>),
    Svm(Svm<f64, bool>),
    ElasticNet(ElasticNet<f64>),
    DecisionTree(DecisionTree<f64, usize>),
    /// Majority vote among the `k` training rows nearest in Euclidean
    /// distance. Rows are unit length, so this is the cosine ordering.
    Neighbors {
        k: usize,
        rows: Array2<f64>,
        labels: Vec<bool>,
    },
}

impl FittedClassifier {
    pub fn predict(&self, x: &Array2<f64>) -> FitResult<Vec<bool>> {
        let decisions = match self {
            FittedClassifier::MultinomialNb(model) => model.predict(x).iter().map(|c| *c == 1).collect(),
            FittedClassifier::GaussianNb(model) => model.predict(x).iter().map(|c| *c == 1).collect(),
            FittedClassifier::Logistic(model) => model.predict(x).iter().map(|c| *c == 1).collect(),
            FittedClassifier::Svm(model) => model.predict(x).to_vec(),
            FittedClassifier::ElasticNet(model) => model.predict(x).iter().map(|v| *v > 0.0).collect(),
            FittedClassifier::DecisionTree(model) => model.predict(x).iter().map(|c| *c == 1).collect(),
            FittedClassifier::Neighbors { k, rows, labels } => vote(*k, rows, labels, x)?,
        };
        Ok(decisions)
    }
}

fn vote(k: usize, rows: &Array2<f64>, labels: &[bool], x: &Array2<f64>) -> FitResult<Vec<bool>> {
    let index = LinearSearch::new().from_batch(rows, L2Dist).map_err(library("knn"))?;
    let k = k.min(rows.nrows());
    let mut decisions = Vec::with_capacity(x.nrows());
    for point in x.rows() {
        let mut neighbours: Vec<(f64, usize)> = index
            .k_nearest(point, k)
            .map_err(library("knn"))?
            .into_iter()
            .map(|(row, i)| ((&row - &point).mapv(|d| d * d).sum(), i))
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let votes = neighbours.iter().filter(|(_, i)| labels[*i]).count();
        let decision = match (2 * votes).cmp(&neighbours.len()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            // tie: the nearest neighbour decides
            std::cmp::Ordering::Equal => neighbours.first().is_some_and(|(_, i)| labels[*i]),
        };
        decisions.push(decision);
    }
    Ok(decisions)
}
