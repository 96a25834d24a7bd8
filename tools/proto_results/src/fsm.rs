use crate::errors::ResultsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStage {
    Invocation,
    Module,
    Run,
    TestCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportEvent {
    InvocationStarted,
    InvocationFailed,
    InvocationEnded,
    ModuleStarted,
    ModuleEnded,
    RunStarted,
    RunFailed,
    RunEnded,
    TestStarted,
    TestOutcome,
    TestEnded,
    Log,
}

/// Where the reporter is: nothing started yet, inside some stage, or done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    NotStarted,
    Open(ReportStage),
    Ended,
}

/// Checks `event` against the innermost open stage. Levels cannot be
/// skipped; a run failure is the one event also legal inside a test case.
pub fn validate_event(position: Position, event: ReportEvent) -> Result<(), ResultsError> {
    use ReportEvent as E;
    use ReportStage as S;

    let allowed = match position {
        Position::NotStarted => matches!(event, E::InvocationStarted),
        Position::Ended => false,
        Position::Open(stage) => match event {
            E::InvocationStarted => false,
            E::InvocationFailed | E::Log => true,
            E::InvocationEnded => stage == S::Invocation,
            E::ModuleStarted => stage == S::Invocation,
            E::ModuleEnded => stage == S::Module,
            E::RunStarted => matches!(stage, S::Invocation | S::Module),
            E::RunFailed => matches!(stage, S::Run | S::TestCase),
            E::RunEnded | E::TestStarted => stage == S::Run,
            E::TestOutcome | E::TestEnded => stage == S::TestCase,
        },
    };

    if !allowed {
        return Err(ResultsError::Sequence(format!(
            "illegal event {:?} at {:?}",
            event, position
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_happy_path_is_accepted() {
        let steps = [
            (Position::NotStarted, ReportEvent::InvocationStarted),
            (Position::Open(ReportStage::Invocation), ReportEvent::ModuleStarted),
            (Position::Open(ReportStage::Module), ReportEvent::RunStarted),
            (Position::Open(ReportStage::Run), ReportEvent::TestStarted),
            (Position::Open(ReportStage::TestCase), ReportEvent::TestOutcome),
            (Position::Open(ReportStage::TestCase), ReportEvent::TestEnded),
            (Position::Open(ReportStage::Run), ReportEvent::RunEnded),
            (Position::Open(ReportStage::Module), ReportEvent::ModuleEnded),
            (Position::Open(ReportStage::Invocation), ReportEvent::InvocationEnded),
        ];
        for (position, event) in steps {
            validate_event(position, event).expect("legal step");
        }
    }

    #[test]
    fn run_failure_is_legal_inside_an_open_test() {
        validate_event(Position::Open(ReportStage::TestCase), ReportEvent::RunFailed)
            .expect("interleaved run failure");
    }

    #[test]
    fn skipping_levels_is_rejected() {
        let err = validate_event(Position::Open(ReportStage::Module), ReportEvent::TestStarted)
            .expect_err("test without run");
        assert!(matches!(err, ResultsError::Sequence(message) if message.contains("illegal event")));

        assert!(validate_event(Position::NotStarted, ReportEvent::RunStarted).is_err());
        assert!(validate_event(Position::Open(ReportStage::Run), ReportEvent::InvocationEnded).is_err());
    }

    #[test]
    fn nothing_is_legal_after_the_invocation_ends() {
        for event in [
            ReportEvent::InvocationStarted,
            ReportEvent::InvocationFailed,
            ReportEvent::Log,
        ] {
            assert!(validate_event(Position::Ended, event).is_err());
        }
    }
}
