use std::fmt;

/// One maintainer entry of a package's `metadata.xml`.
///
/// At least one of `name` and `email` is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Maintainer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// `person` or `project`, when given.
    pub maint_type: Option<String>,
}

impl Maintainer {
    /// A maintainer known by email only.
    pub fn with_email(email: impl Into<String>) -> Self {
        Maintainer {
            email: Some(email.into()),
            ..Default::default()
        }
    }

    /// A maintainer known by name only.
    pub fn with_name(name: impl Into<String>) -> Self {
        Maintainer {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl fmt::Display for Maintainer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.name, &self.email) {
            (Some(name), Some(email)) => write!(f, "{name} <{email}>")?,
            (Some(name), None) => write!(f, "{name}")?,
            (None, Some(email)) => write!(f, "{email}")?,
            (None, None) => {}
        }
        if let Some(description) = &self.description {
            write!(f, " ({description})")?;
        }
        Ok(())
    }
}

/// Per-package data from `metadata.xml`, shared by every version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PkgMetadata {
    pub maintainers: Vec<Maintainer>,
    pub herds: Vec<String>,
    pub longdescription: Option<String>,
}

impl PkgMetadata {
    /// Set the long description with whitespace runs collapsed; blank text
    /// means none.
    pub fn with_longdescription(mut self, text: &str) -> Self {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        self.longdescription = (!text.is_empty()).then_some(text);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintainer_display() {
        let mut m = Maintainer::with_email("dev@gentoo.org");
        assert_eq!(m.to_string(), "dev@gentoo.org");
        m.name = Some("A Dev".to_string());
        assert_eq!(m.to_string(), "A Dev <dev@gentoo.org>");
        m.description = Some("backup".to_string());
        assert_eq!(m.to_string(), "A Dev <dev@gentoo.org> (backup)");
        assert_eq!(Maintainer::with_name("Team").to_string(), "Team");
    }

    #[test]
    fn longdescription_normalized() {
        let meta = PkgMetadata::default().with_longdescription("\n  A long\n\tstory  ");
        assert_eq!(meta.longdescription.as_deref(), Some("A long story"));
        let meta = PkgMetadata::default().with_longdescription("   ");
        assert!(meta.longdescription.is_none());
    }
}
