// src/step/classify.rs

//! Pattern-based classification of captured process output.
//!
//! An external tool exiting zero can still have failed (a plugin that
//! prints a stack trace and keeps going), and a noisy tool can succeed
//! while complaining. The classifier scans captured streams against a
//! taxonomy of known-fatal patterns and known-benign noise.

use std::fmt::Debug;

use regex::Regex;

/// Result of scanning captured output.
#[derive(Debug, Clone, Default)]
pub struct OutputScan {
    /// Lines that matched a fatal pattern (and no whitelist entry).
    pub fatal_lines: Vec<String>,
}

impl OutputScan {
    pub fn is_fatal(&self) -> bool {
        !self.fatal_lines.is_empty()
    }

    /// Human-readable diagnostic for event annotations.
    pub fn diagnostic(&self) -> String {
        self.fatal_lines.join("; ")
    }
}

/// Classifier capability, separate from the [`Step`](crate::step::Step)
/// capability so the two compose freely.
pub trait ErrorClassifier: Send + Sync + Debug {
    /// Scan captured output. Must tolerate empty input (process not yet
    /// started) by reporting a clean scan, never by erroring.
    fn classify(&self, output: &str) -> OutputScan;
}

/// Regex taxonomy: fatal patterns vs. whitelisted noise.
#[derive(Debug)]
pub struct PatternClassifier {
    fatal: Vec<Regex>,
    benign: Vec<Regex>,
}

impl PatternClassifier {
    pub fn new(fatal: Vec<Regex>, benign: Vec<Regex>) -> Self {
        Self { fatal, benign }
    }

    /// The standard taxonomy used for wrapped image-processing tools.
    pub fn standard() -> Self {
        let fatal = [
            r"(?i)segmentation fault",
            r"(?i)core dumped",
            r"(?i)\berror\b",
            r"(?i)\bexception\b",
            r"(?i)fail(ed)? to call plugin",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        // Known-harmless noise from headless rendering environments.
        let benign = [r"(?i)warning:.*font", r"(?i)fontconfig"]
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect();

        Self { fatal, benign }
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, output: &str) -> OutputScan {
        let mut scan = OutputScan::default();

        for line in output.lines() {
            if self.benign.iter().any(|re| re.is_match(line)) {
                continue;
            }
            if self.fatal.iter().any(|re| re.is_match(line)) {
                scan.fatal_lines.push(line.to_string());
            }
        }

        scan
    }
}
