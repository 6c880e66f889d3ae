/// Where a piece of work came from. Unknown origins fall back to the lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Interactive,
    Manager,
    Admin,
    Unknown,
}

impl Source {
    pub fn priority(&self) -> i32 {
        match self {
            Source::Interactive => 100,
            Source::Manager => 80,
            Source::Admin => 20,
            Source::Unknown => 0,
        }
    }
}

impl From<&str> for Source {
    fn from(source: &str) -> Self {
        match source.trim().to_ascii_lowercase().as_str() {
            "interactive" | "user" => Source::Interactive,
            "manager" | "equipment" => Source::Manager,
            "admin" | "backfill" => Source::Admin,
            _ => Source::Unknown,
        }
    }
}

pub fn priority_from_source(source: &str) -> i32 {
    Source::from(source).priority()
}
