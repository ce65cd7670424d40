use crate::entry::BackupCursor;

/// Contract between the engine and an application-defined command. The
/// engine calls `parse` before `redo`, `backup` against a fresh entry's
/// cursor before the first `redo`, and `undo` against the same bytes later.
pub trait Command: Send {
    fn help_text(&self) -> &str;

    fn parse(&mut self, line: &str) -> crate::Result<()>;

    fn redo(&mut self) -> crate::Result<()>;

    fn backup(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()>;

    fn undo(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()>;
}

// First whitespace-delimited token of a command line.
pub fn command_name(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

// The standard help option every registered command supports.
pub fn wants_help(line: &str) -> bool {
    line.split_whitespace()
        .skip(1)
        .any(|token| token == "-h" || token == "--h")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_is_first_token() {
        assert_eq!(command_name("-Move -T 10 20"), "-Move");
        assert_eq!(command_name("  -Move"), "-Move");
        assert_eq!(command_name(""), "");
    }

    #[test]
    fn test_help_flag_detection() {
        assert!(wants_help("-Move -h"));
        assert!(wants_help("-Move --h"));
        assert!(!wants_help("-Move -T 10 20"));
        // The name token itself is not an option.
        assert!(!wants_help("-h"));
    }
}
