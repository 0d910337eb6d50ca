//! Simulated feedback turns
//!
//! After each execution the loop appends a turn that reads as if the user
//! had run the code and pasted the result back. The wording is fixed so the
//! upstream prompt can rely on it.

/// Sent when the code produced neither stdout nor stderr
pub const NO_OUTPUT_OR_ERROR: &str = "Your code has run without issues, without any standard output.\n";

const OUTPUT_INTRO: &str = "I have executed your code and this is the output.";
const ERROR_INTRO: &str = "I have executed your code and this is the error.";

pub const IMAGE_RETURNED: &str = "\n\nThe code executed returned an image.";
pub const IMAGE_NOT_RETURNED: &str = "\n\nThe code executed did not return any image.";

/// Shown to the end user when forwarded output was cut
pub const OUTPUT_TRUNCATED_NOTICE: &str = "\n\nThere is too much output, this is the partial output.\n\n";

/// Whether a round produced a plot, and whether that is worth mentioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// The code never touched the plotting library
    NotPlotted,
    /// An image was captured and published
    Produced,
    /// The code used the plotting library but no image came out
    NotProduced,
}

impl ImageOutcome {
    pub fn from_run(code: &str, image_present: bool) -> Self {
        if image_present {
            ImageOutcome::Produced
        } else if references_plotting(code) {
            ImageOutcome::NotProduced
        } else {
            ImageOutcome::NotPlotted
        }
    }
}

/// Whether `code` uses the plotting library
pub fn references_plotting(code: &str) -> bool {
    code.contains("matplotlib")
}

fn fenced(tag: &str, body: &str) -> String {
    format!("```{}\n{}\n```", tag, body.trim_end_matches('\n'))
}

/// Build the simulated user message for one execution
pub fn synthesize(output: &str, error: &str, image: ImageOutcome) -> String {
    let mut reply = match (output.is_empty(), error.is_empty()) {
        (false, false) => format!(
            "{}\n{}\n\n{}\n",
            ERROR_INTRO,
            fenced("output", output),
            fenced("error", error)
        ),
        (false, true) => format!("{}\n{}\n", OUTPUT_INTRO, fenced("output", output)),
        (true, false) => format!("{}\n{}\n", ERROR_INTRO, fenced("error", error)),
        (true, true) => NO_OUTPUT_OR_ERROR.to_string(),
    };

    match image {
        ImageOutcome::Produced => reply.push_str(IMAGE_RETURNED),
        ImageOutcome::NotProduced => reply.push_str(IMAGE_NOT_RETURNED),
        ImageOutcome::NotPlotted => {}
    }
    reply
}

/// Output block forwarded to the end user
pub fn output_block(output: &str) -> String {
    format!("\n\n{}\n\n", fenced("output", output))
}

/// Error block forwarded to the end user
pub fn error_block(error: &str) -> String {
    format!("\n\n{}\n\n", fenced("error", error))
}

/// Markdown image reference for a published plot
pub fn image_reference(url: &str) -> String {
    format!("\n\n![plot]({})", url)
}

/// Cut `text` to at most `max_chars` characters; the flag says whether
/// anything was dropped
pub fn truncate_output(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_output_or_error_is_fixed_message() {
        let reply = synthesize("", "", ImageOutcome::NotPlotted);
        assert_eq!(reply, NO_OUTPUT_OR_ERROR);
        assert!(!reply.contains("```"));
    }

    #[test]
    fn test_output_only() {
        let reply = synthesize("42\n", "", ImageOutcome::NotPlotted);
        assert_eq!(
            reply,
            "I have executed your code and this is the output.\n```output\n42\n```\n"
        );
        assert_eq!(reply.matches("```output").count(), 1);
        assert!(!reply.contains("```error"));
    }

    #[test]
    fn test_whitespace_output_still_counts_as_output() {
        let reply = synthesize("\n", "", ImageOutcome::NotPlotted);
        assert_ne!(reply, NO_OUTPUT_OR_ERROR);
        assert!(reply.starts_with(OUTPUT_INTRO));
        assert_eq!(reply.matches("```output").count(), 1);
    }

    #[test]
    fn test_error_only() {
        let reply = synthesize("", "Traceback (most recent call last):\nNameError", ImageOutcome::NotPlotted);
        assert!(reply.starts_with("I have executed your code and this is the error.\n"));
        assert_eq!(reply.matches("```error").count(), 1);
        assert!(!reply.contains("```output"));
    }

    #[test]
    fn test_output_and_error_order() {
        let reply = synthesize("out", "err", ImageOutcome::NotPlotted);
        assert!(reply.starts_with("I have executed your code and this is the error."));
        let out = reply.find("```output\nout\n```").unwrap();
        let err = reply.find("```error\nerr\n```").unwrap();
        assert!(out < err);
    }

    #[test]
    fn test_image_sentences() {
        let produced = synthesize("", "", ImageOutcome::Produced);
        assert!(produced.ends_with(IMAGE_RETURNED));

        let missing = synthesize("1\n", "", ImageOutcome::NotProduced);
        assert!(missing.ends_with(IMAGE_NOT_RETURNED));

        let none = synthesize("1\n", "", ImageOutcome::NotPlotted);
        assert!(!none.contains("image"));
    }

    #[test]
    fn test_image_outcome_from_run() {
        assert_eq!(ImageOutcome::from_run("print(1)", false), ImageOutcome::NotPlotted);
        assert_eq!(
            ImageOutcome::from_run("import matplotlib.pyplot as plt", false),
            ImageOutcome::NotProduced
        );
        assert_eq!(ImageOutcome::from_run("print(1)", true), ImageOutcome::Produced);
    }

    #[test]
    fn test_user_visible_blocks() {
        assert_eq!(output_block("hi\n"), "\n\n```output\nhi\n```\n\n");
        assert_eq!(error_block("boom"), "\n\n```error\nboom\n```\n\n");
        assert_eq!(image_reference("https://i.example/p.png"), "\n\n![plot](https://i.example/p.png)");
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("abcdef", 3), ("abc", true));
        assert_eq!(truncate_output("abc", 3), ("abc", false));
        assert_eq!(truncate_output("日本語", 2), ("日本", true));
    }
}
