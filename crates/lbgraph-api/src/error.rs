use std::fmt;

/// A config or domain input that failed to parse or validate.
///
/// The error names the offending field with a dotted path like
/// `tls[1].hosts`, so a bad ingress can be reported without dumping the
/// whole object.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
pub struct Error {
    message: String,

    // segments are pushed as the error is returned up the stack, so the
    // innermost field comes first.
    segments: Vec<Segment>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    Field(&'static str),
    Index(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str(&self.message);
        }
        write!(f, "{}: {}", self.path(), self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("path", &self.path())
            .field("message", &self.message)
            .finish()
    }
}

impl Error {
    pub(crate) fn new(message: String) -> Self {
        Self {
            message,
            segments: Vec::new(),
        }
    }

    pub(crate) fn new_static(message: &'static str) -> Self {
        Self::new(message.to_string())
    }

    /// The dotted path to the field that failed, or an empty string when the
    /// whole document is at fault.
    pub fn path(&self) -> String {
        let mut path = String::new();
        for segment in self.segments.iter().rev() {
            match segment {
                Segment::Field(name) => {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(name);
                }
                Segment::Index(idx) => {
                    path.push('[');
                    path.push_str(&idx.to_string());
                    path.push(']');
                }
            }
        }
        path
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn push(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }
}

/// Adds path context to a failed validation on its way out.
///
/// A validator only names its own fields. Its caller names the field the
/// validated value lives in.
pub(crate) trait ErrorContext<T>: Sized {
    fn with_field(self, field: &'static str) -> Result<T, Error>;

    fn with_index(self, index: usize) -> Result<T, Error>;

    /// Context for the `index`-th item of the list in `field`.
    fn with_field_index(self, field: &'static str, index: usize) -> Result<T, Error> {
        self.with_index(index).with_field(field)
    }
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn with_field(self, field: &'static str) -> Result<T, Error> {
        self.map_err(|e| e.push(Segment::Field(field)))
    }

    fn with_index(self, index: usize) -> Result<T, Error> {
        self.map_err(|e| e.push(Segment::Index(index)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nested_path() {
        fn host() -> Result<(), Error> {
            Err(Error::new_static("host must not be empty"))
        }

        let err = host()
            .with_field_index("hosts", 2)
            .with_field_index("tls", 1)
            .unwrap_err();
        assert_eq!(err.path(), "tls[1].hosts[2]");
        assert_eq!(err.to_string(), "tls[1].hosts[2]: host must not be empty");
    }

    #[test]
    fn test_index_at_root() {
        let err: Result<(), _> = Err(Error::new_static("bad path"));
        let err = err.with_field("path").with_index(0).unwrap_err();
        assert_eq!(err.path(), "[0].path");
    }

    #[test]
    fn test_error_without_path() {
        let err = Error::new("bad document".to_string());
        assert_eq!(err.path(), "");
        assert_eq!(err.to_string(), "bad document");
    }
}
