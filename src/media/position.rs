//! Retry rules for one requested thumbnail position.

use crate::error::ProbeError;

/// What one requested position yielded.
#[derive(Debug)]
pub enum Attempt<T> {
    Frame(T),
    /// Nothing decodable; the caller substitutes the test pattern.
    Fallback,
    Failed(ProbeError),
}

/// Run `extract` for `position`, seeking first when `want_seek` and
/// `can_seek` allow it. `extract` receives the position to seek to, or
/// `None` to read from the start.
///
/// An unsupported seek clears `can_seek` and retries from the start, and so
/// does a seek that ran off the end. End of file or a missing video stream
/// after that asks for the fallback. Anything else fails the position.
pub fn attempt_position<T>(
    position: f64,
    want_seek: bool,
    can_seek: &mut bool,
    mut extract: impl FnMut(Option<f64>) -> Result<T, ProbeError>,
) -> Attempt<T> {
    let result = if want_seek && *can_seek {
        match extract(Some(position)) {
            Err(ProbeError::SeekUnsupported) => {
                *can_seek = false;
                extract(None)
            }
            Err(ProbeError::EndOfFile) => extract(None),
            other => other,
        }
    } else {
        extract(None)
    };

    match result {
        Ok(frame) => Attempt::Frame(frame),
        Err(e) if e.wants_fallback() => {
            if matches!(e, ProbeError::NoVideoStream) {
                *can_seek = false;
            }
            Attempt::Fallback
        }
        Err(e) => Attempt::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out canned results in order and remembers what it was asked.
    struct Script {
        results: Vec<Result<&'static str, ProbeError>>,
        calls: Vec<Option<f64>>,
    }

    impl Script {
        fn new(results: Vec<Result<&'static str, ProbeError>>) -> Self {
            Self {
                results: results.into_iter().rev().collect(),
                calls: Vec::new(),
            }
        }

        fn run(&mut self, want_seek: bool, can_seek: &mut bool) -> Attempt<&'static str> {
            attempt_position(0.25, want_seek, can_seek, |at| {
                self.calls.push(at);
                self.results.pop().unwrap_or(Err(ProbeError::EndOfFile))
            })
        }
    }

    #[test]
    fn test_seek_succeeds() {
        let mut script = Script::new(vec![Ok("frame")]);
        let mut can_seek = true;
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Frame("frame")));
        assert!(can_seek);
        assert_eq!(script.calls, vec![Some(0.25)]);
    }

    #[test]
    fn test_unsupported_seek_retries_from_start() {
        let mut script = Script::new(vec![Err(ProbeError::SeekUnsupported), Ok("start")]);
        let mut can_seek = true;
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Frame("start")));
        assert!(!can_seek);
        assert_eq!(script.calls, vec![Some(0.25), None]);

        // later positions no longer try to seek
        let mut script = Script::new(vec![Ok("again")]);
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Frame("again")));
        assert_eq!(script.calls, vec![None]);
    }

    #[test]
    fn test_end_of_file_twice_falls_back() {
        let mut script = Script::new(vec![Err(ProbeError::EndOfFile), Err(ProbeError::EndOfFile)]);
        let mut can_seek = true;
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Fallback));
        assert!(can_seek);
        assert_eq!(script.calls, vec![Some(0.25), None]);
    }

    #[test]
    fn test_no_video_stream_falls_back_and_stops_seeking() {
        let mut script = Script::new(vec![Err(ProbeError::NoVideoStream)]);
        let mut can_seek = true;
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Fallback));
        assert!(!can_seek);
        assert_eq!(script.calls.len(), 1);
    }

    #[test]
    fn test_decode_error_fails_without_retry() {
        let mut script = Script::new(vec![Err(ProbeError::Decode("corrupt slice".to_string()))]);
        let mut can_seek = true;
        assert!(matches!(
            script.run(true, &mut can_seek),
            Attempt::Failed(ProbeError::Decode(_))
        ));
        assert!(can_seek);
        assert_eq!(script.calls, vec![Some(0.25)]);
    }

    #[test]
    fn test_decode_error_after_unsupported_seek() {
        let mut script = Script::new(vec![
            Err(ProbeError::SeekUnsupported),
            Err(ProbeError::Decode("corrupt slice".to_string())),
        ]);
        let mut can_seek = true;
        assert!(matches!(script.run(true, &mut can_seek), Attempt::Failed(_)));
        assert!(!can_seek);
    }

    #[test]
    fn test_without_seek_reads_from_start() {
        let mut script = Script::new(vec![Ok("first")]);
        let mut can_seek = true;
        assert!(matches!(script.run(false, &mut can_seek), Attempt::Frame("first")));
        assert_eq!(script.calls, vec![None]);
    }
}
