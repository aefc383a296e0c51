//! Moments of sets of utterances, and their normalization.

use std::fs;
use std::path::Path;

use log::info;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Divisor used to scale de-meaned values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormType {
    /// Standard deviation.
    Stds,
    /// Difference between the extremum values.
    Spread,
}

impl NormType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "stds" => Ok(NormType::Stds),
            "spread" => Ok(NormType::Spread),
            _ => Err(Error::Lookup {
                kind: "normalization type",
                name: name.to_owned(),
            }),
        }
    }
}

/// Per-feature statistics of a single `(time, features)` array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureMoments {
    pub means: Array1<f32>,
    pub stds: Array1<f32>,
    pub spread: Array1<f32>,
}

impl FeatureMoments {
    pub fn compute(data: ArrayView2<'_, f32>) -> Result<Self> {
        let means = data
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Value("Cannot compute the moments of an empty array.".to_owned()))?;
        let stds = data.std_axis(Axis(0), 0.);
        let max = data.fold_axis(Axis(0), f32::NEG_INFINITY, |&a, &b| a.max(b));
        let min = data.fold_axis(Axis(0), f32::INFINITY, |&a, &b| a.min(b));
        Ok(Self {
            means,
            stds,
            spread: max - min,
        })
    }

    fn divisor(&self, norm_type: NormType) -> &Array1<f32> {
        match norm_type {
            NormType::Stds => &self.stds,
            NormType::Spread => &self.spread,
        }
    }

    /// De-mean `data` and scale it by the chosen divisor. Features whose divisor is zero
    /// are only de-meaned.
    pub fn normalize(&self, data: ArrayView2<'_, f32>, norm_type: NormType) -> Result<Array2<f32>> {
        if data.ncols() != self.means.len() {
            return Err(Error::Shape(format!(
                "Expected {} features, got {}.",
                self.means.len(),
                data.ncols()
            )));
        }
        let divisor = self.divisor(norm_type).mapv(|d| if d == 0. { 1. } else { d });
        Ok((&data - &self.means) / &divisor)
    }
}

/// File-wise and global moments of a set of utterances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub files: Vec<FeatureMoments>,
    /// Moments of all utterances concatenated along time.
    pub global: FeatureMoments,
}

impl Moments {
    pub fn compute(utterances: &[Array2<f32>]) -> Result<Self> {
        if utterances.is_empty() {
            return Err(Error::Value("Cannot compute the moments of no utterance.".to_owned()));
        }
        let files = utterances
            .iter()
            .map(|u| FeatureMoments::compute(u.view()))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = utterances.iter().map(|u| u.view()).collect();
        let all = concatenate(Axis(0), &views).map_err(|e| Error::Shape(e.to_string()))?;
        Ok(Self {
            files,
            global: FeatureMoments::compute(all.view())?,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_owned()));
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string(self)?)?;
        info!("Saved moments of {} utterances to '{}'", self.files.len(), path.display());
        Ok(())
    }
}

/// Normalize utterances with the global moments of the whole set.
pub fn normalize_corpus(utterances: &[Array2<f32>], norm_type: NormType) -> Result<Vec<Array2<f32>>> {
    let moments = Moments::compute(utterances)?;
    utterances
        .iter()
        .map(|u| moments.global.normalize(u.view(), norm_type))
        .collect()
}

/// Normalize each utterance with its own moments.
pub fn normalize_by_file(utterances: &[Array2<f32>], norm_type: NormType) -> Result<Vec<Array2<f32>>> {
    if utterances.is_empty() {
        return Err(Error::Value("Cannot normalize no utterance.".to_owned()));
    }
    utterances
        .iter()
        .map(|u| FeatureMoments::compute(u.view())?.normalize(u.view(), norm_type))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn corpus() -> Vec<Array2<f32>> {
        vec![array![[0., 1.], [2., 1.]], array![[4., 1.], [6., 5.], [8., 1.]]]
    }

    #[test]
    fn moments() {
        let moments = Moments::compute(&corpus()).unwrap();
        assert_eq!(moments.files.len(), 2);
        assert_eq!(moments.files[0].means, array![1., 1.]);
        assert_eq!(moments.files[0].stds, array![1., 0.]);
        assert_eq!(moments.files[1].spread, array![4., 4.]);
        assert_eq!(moments.global.means, array![4., 1.8]);
        assert_eq!(moments.global.spread, array![8., 4.]);
        assert_relative_eq!(moments.global.stds[0], 8f32.sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn corpus_normalization_is_centered() {
        let normed = normalize_corpus(&corpus(), NormType::Stds).unwrap();
        let all = concatenate(Axis(0), &[normed[0].view(), normed[1].view()]).unwrap();
        let moments = FeatureMoments::compute(all.view()).unwrap();
        for j in 0..2 {
            assert_relative_eq!(moments.means[j], 0., epsilon = 1e-5);
            assert_relative_eq!(moments.stds[j], 1., epsilon = 1e-5);
        }
    }

    #[test]
    fn file_normalization() {
        let normed = normalize_by_file(&corpus(), NormType::Spread).unwrap();
        assert_eq!(normed[0], array![[-0.5, 0.], [0.5, 0.]]);
        assert_eq!(normed[1].column(0), array![-0.5, 0., 0.5]);
    }

    #[test]
    fn invalid_inputs() {
        assert!(matches!(Moments::compute(&[]), Err(Error::Value(_))));
        assert!(matches!(normalize_by_file(&[], NormType::Stds), Err(Error::Value(_))));
        assert!(matches!(NormType::from_name("range"), Err(Error::Lookup { .. })));
        let mixed = vec![array![[0., 1.]], array![[0., 1., 2.]]];
        assert!(matches!(Moments::compute(&mixed), Err(Error::Shape(_))));
    }

    #[test]
    fn moments_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moments.json");
        let moments = Moments::compute(&corpus()).unwrap();
        moments.save(&path).unwrap();
        assert_eq!(Moments::load(&path).unwrap(), moments);
        assert!(matches!(
            Moments::load(dir.path().join("missing.json")),
            Err(Error::FileNotFound(_))
        ));
    }
}
