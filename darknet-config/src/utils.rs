use crate::{common::*, config::LayerKind, error::ConfigError};
use serde::de::value::{Error as DeError, StrDeserializer};

/// Where a set of options came from, used to attribute errors.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope<'a> {
    Net,
    Layer { index: usize, kind: &'a LayerKind },
}

/// Typed accessors over the raw `key=value` options of a section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Params<'a> {
    scope: Scope<'a>,
    params: &'a IndexMap<String, String>,
}

impl<'a> Params<'a> {
    pub fn net(params: &'a IndexMap<String, String>) -> Self {
        Self {
            scope: Scope::Net,
            params,
        }
    }

    pub fn layer(index: usize, kind: &'a LayerKind, params: &'a IndexMap<String, String>) -> Self {
        Self {
            scope: Scope::Layer { index, kind },
            params,
        }
    }

    pub fn error(&self, reason: impl Display) -> ConfigError {
        match self.scope {
            Scope::Net => ConfigError::net(reason),
            Scope::Layer { index, kind } => ConfigError::layer(index, kind, reason),
        }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get_opt(key)?
            .ok_or_else(|| self.error(format!("'{}' is required", key)).into())
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    pub fn get_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.params
            .get(key)
            .map(|text| {
                text.parse::<T>().map_err(|err| {
                    self.error(format!("invalid value '{}' for '{}': {}", text, key, err))
                })
            })
            .transpose()
            .map_err(Error::from)
    }

    /// Parses a comma-separated list. An absent key gives `None`.
    pub fn list_opt<T>(&self, key: &str) -> Result<Option<Vec<T>>>
    where
        T: FromStr,
        T::Err: Display,
    {
        let text = match self.params.get(key) {
            Some(text) => text,
            None => return Ok(None),
        };

        let values: Vec<T> = text
            .split(',')
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<T>().map_err(|err| {
                    self.error(format!("invalid item '{}' in '{}': {}", item, key, err))
                })
            })
            .try_collect()?;

        ensure!(!values.is_empty(), self.error(format!("'{}' is empty", key)));
        Ok(Some(values))
    }

    pub fn list<T>(&self, key: &str) -> Result<Vec<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.list_opt(key)?
            .ok_or_else(|| self.error(format!("'{}' is required", key)).into())
    }

    pub fn activation(&self, key: &str, default: Activation) -> Result<Activation> {
        let text = match self.params.get(key) {
            Some(text) => text.as_str(),
            None => return Ok(default),
        };
        let deserializer: StrDeserializer<DeError> = text.into_deserializer();
        let activation = Activation::deserialize(deserializer)
            .map_err(|_| self.error(format!("unsupported activation '{}'", text)))?;
        Ok(activation)
    }

    /// Emits a warning for every option not in `known`.
    pub fn warn_unused(&self, known: &[&str]) {
        self.params
            .keys()
            .filter(|key| !known.contains(&key.as_str()))
            .for_each(|key| match self.scope {
                Scope::Net => warn!("[net] option '{}' is ignored", key),
                Scope::Layer { index, kind } => {
                    warn!("layer {} ({}): option '{}' is ignored", index, kind, key)
                }
            });
    }

    pub fn unused(&self, known: &[&str]) -> IndexMap<String, String> {
        self.params
            .iter()
            .filter(|(key, _)| !known.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|&(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn typed_accessors() -> Result<()> {
        let map = options(&[("size", "3"), ("mask", "3, 4,5"), ("activation", "leaky")]);
        let kind = LayerKind::Convolutional;
        let params = Params::layer(2, &kind, &map);

        assert_eq!(params.get::<usize>("size")?, 3);
        assert_eq!(params.get_or::<usize>("stride", 1)?, 1);
        assert_eq!(params.list::<usize>("mask")?, vec![3, 4, 5]);
        assert_eq!(params.list_opt::<usize>("anchors")?, None);
        assert_eq!(
            params.activation("activation", Activation::Linear)?,
            Activation::Leaky
        );
        Ok(())
    }

    #[test]
    fn errors_name_the_layer() {
        let map = options(&[("size", "three"), ("activation", "elu")]);
        let kind = LayerKind::Convolutional;
        let params = Params::layer(7, &kind, &map);

        let err = params.get::<usize>("size").unwrap_err();
        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::Layer { index, kind, .. }) => {
                assert_eq!(*index, 7);
                assert_eq!(kind, "convolutional");
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(params.activation("activation", Activation::Linear).is_err());
        assert!(params.get::<usize>("filters").is_err());
    }
}
