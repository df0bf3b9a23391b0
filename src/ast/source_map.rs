/// Maps byte offsets to 1-based line/column positions. Built once per
/// compile and queried for every emitted instruction.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> SourceMap {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (u64, u64) {
        let line = self.line_starts.partition_point(|&start| start <= offset) - 1;
        let col = offset - self.line_starts[line];
        (line as u64 + 1, col as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_across_lines() {
        let sm = SourceMap::new("ab\ncd\nef");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(2), (1, 3)); // the newline belongs to line 1
        assert_eq!(sm.lookup(3), (2, 1));
        assert_eq!(sm.lookup(6), (3, 1));
        assert_eq!(sm.lookup(7), (3, 2));
    }

    #[test]
    fn empty_source_is_line_one() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
    }
}
