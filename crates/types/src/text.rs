//! Validated names used by templates and resources.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("text cannot be empty")]
    Empty,
}

/// A trimmed, non-empty name such as a resource type, template path or binding name.
///
/// Template loading wraps every user-supplied name in this type so that the evaluation engine
/// never has to guard against blank identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText`, trimming leading and trailing whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Template files name resources and types with this; a blank name fails deserialization.
impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_input() {
        let name = NonEmptyText::new("  Observation ").expect("valid name");
        assert_eq!(name.as_str(), "Observation");
    }

    #[test]
    fn rejects_blank_input() {
        assert!(matches!(NonEmptyText::new(" \t"), Err(TextError::Empty)));
    }

    #[test]
    fn deserialize_rejects_blank_yaml_string() {
        let err = serde_yaml::from_str::<NonEmptyText>("'  '").expect_err("blank must fail");
        assert!(err.to_string().contains("cannot be empty"));
    }
}
