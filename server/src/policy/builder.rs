use super::{
    AcceptAll, AdmissionPolicy, MetadataKey, PolicyHost, RequireKeys, Sample, SelectAll,
    SelectionPolicy, Uniform, WeightPolicy,
};
use crate::{
    config::{AdmissionSpec, PolicyConfig, SelectionSpec, WeightingSpec},
    error::{Result, SessionErr},
};

/// Builds the `PolicyHost` of a session given its policy configuration.
pub struct PolicyBuilder;

impl PolicyBuilder {
    /// Creates a new `PolicyBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `PolicyHost` following `config`.
    ///
    /// # Arguments
    /// * `config` - The built-in policies to use.
    ///
    /// # Returns
    /// A new `PolicyHost` or `SessionErr::InvalidConfig` if a policy has invalid parameters.
    pub fn build(&self, config: &PolicyConfig) -> Result<PolicyHost> {
        let admission = self.resolve_admission(&config.admission);
        let selection = self.resolve_selection(&config.selection)?;
        let weighting = self.resolve_weighting(&config.weighting);

        Ok(PolicyHost {
            admission,
            selection,
            weighting,
        })
    }

    fn resolve_admission(&self, spec: &AdmissionSpec) -> Box<dyn AdmissionPolicy> {
        match spec {
            AdmissionSpec::AcceptAll => Box::new(AcceptAll),
            AdmissionSpec::RequireKeys { keys } => Box::new(RequireKeys::new(keys.clone())),
        }
    }

    fn resolve_selection(&self, spec: &SelectionSpec) -> Result<Box<dyn SelectionPolicy>> {
        match *spec {
            SelectionSpec::All => Ok(Box::new(SelectAll)),
            SelectionSpec::Sample {
                fraction,
                min,
                seed,
            } => {
                if !(fraction > 0. && fraction <= 1.) {
                    return Err(SessionErr::InvalidConfig(format!(
                        "sample fraction must be in (0, 1], got {fraction}"
                    )));
                }

                Ok(Box::new(Sample::new(fraction, min, seed)))
            }
        }
    }

    fn resolve_weighting(&self, spec: &WeightingSpec) -> Box<dyn WeightPolicy> {
        match spec {
            WeightingSpec::Uniform => Box::new(Uniform),
            WeightingSpec::MetadataKey { key } => Box::new(MetadataKey::new(key.clone())),
        }
    }
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
