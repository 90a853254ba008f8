//! Event kinds: one per comparison operator, per traversal phase, per profile event.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::InterceptError;

/// A closed set of event kinds sharing one dispatch point.
///
/// `index()` must be the kind's position in `ALL`; registries size and address their
/// handler slots with it.
pub trait EventKind: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const ALL: &'static [Self];
    /// Interceptor family name used in errors and logs.
    const INTERCEPTOR: &'static str;

    fn index(self) -> usize;
    fn name(self) -> &'static str;

    /// Case-insensitive lookup by name, plus any extra spellings the kind accepts.
    fn parse(text: &str) -> Result<Self, InterceptError> {
        let wanted = text.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(wanted) || kind.matches_alias(wanted))
            .ok_or_else(|| InterceptError::unknown_kind(Self::INTERCEPTOR, text))
    }

    fn matches_alias(self, _text: &str) -> bool {
        false
    }
}

/// Rich comparison operators, numbered the way CPython numbers them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => CompareOp::Lt,
            1 => CompareOp::Le,
            2 => CompareOp::Eq,
            3 => CompareOp::Ne,
            4 => CompareOp::Gt,
            5 => CompareOp::Ge,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    /// Structural comparison for native values; `None` ordering only satisfies `!=`.
    pub fn matches(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }

    pub fn apply<T: PartialOrd + ?Sized>(self, lhs: &T, rhs: &T) -> bool {
        self.matches(lhs.partial_cmp(rhs))
    }
}

impl EventKind for CompareOp {
    const ALL: &'static [Self] = &[
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
    ];
    const INTERCEPTOR: &'static str = "comparison";

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }

    fn matches_alias(self, text: &str) -> bool {
        self.symbol() == text
    }
}

/// Phases of one traversal through an iteration proxy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IterationKind {
    Start,
    Step,
    End,
}

impl EventKind for IterationKind {
    const ALL: &'static [Self] = &[IterationKind::Start, IterationKind::Step, IterationKind::End];
    const INTERCEPTOR: &'static str = "iteration";

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            IterationKind::Start => "start",
            IterationKind::Step => "step",
            IterationKind::End => "end",
        }
    }

    // "next" is what the loop-patching API historically called a step.
    fn matches_alias(self, text: &str) -> bool {
        self == IterationKind::Step && text.eq_ignore_ascii_case("next")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ProfileKind {
    Call,
    Return,
}

impl ProfileKind {
    /// Maps a profile-hook event name; C-function events have no kind.
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "call" => Some(ProfileKind::Call),
            "return" => Some(ProfileKind::Return),
            _ => None,
        }
    }
}

impl EventKind for ProfileKind {
    const ALL: &'static [Self] = &[ProfileKind::Call, ProfileKind::Return];
    const INTERCEPTOR: &'static str = "profile";

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            ProfileKind::Call => "call",
            ProfileKind::Return => "return",
        }
    }
}

macro_rules! kind_display_and_from_str {
    ($($kind:ty),* $(,)?) => {$(
        impl fmt::Display for $kind {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $kind {
            type Err = InterceptError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$kind as EventKind>::parse(s)
            }
        }
    )*};
}

kind_display_and_from_str!(CompareOp, IterationKind, ProfileKind);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_position_in_all() {
        fn check<K: EventKind>() {
            for (position, kind) in K::ALL.iter().enumerate() {
                assert_eq!(kind.index(), position, "{kind:?}");
            }
        }
        check::<CompareOp>();
        check::<IterationKind>();
        check::<ProfileKind>();
    }

    #[test]
    fn test_compare_op_raw_numbering() {
        for raw in 0..6 {
            assert_eq!(CompareOp::from_raw(raw).unwrap() as i32, raw);
        }
        assert_eq!(CompareOp::from_raw(2), Some(CompareOp::Eq));
        assert_eq!(CompareOp::from_raw(6), None);
        assert_eq!(CompareOp::from_raw(-1), None);
    }

    #[test]
    fn test_parse_accepts_names_and_symbols() {
        assert_eq!("EQ".parse::<CompareOp>().unwrap(), CompareOp::Eq);
        assert_eq!("<=".parse::<CompareOp>().unwrap(), CompareOp::Le);
        assert_eq!(" ge ".parse::<CompareOp>().unwrap(), CompareOp::Ge);
        assert_eq!("next".parse::<IterationKind>().unwrap(), IterationKind::Step);
        assert_eq!("Return".parse::<ProfileKind>().unwrap(), ProfileKind::Return);

        let err = "<>".parse::<CompareOp>().unwrap_err();
        assert!(matches!(
            err,
            InterceptError::UnknownKind {
                interceptor: "comparison",
                ..
            }
        ));
    }

    #[test]
    fn test_matches_agrees_with_native_operators() {
        let pairs = [(1, 2), (2, 2), (3, 2)];
        for (a, b) in pairs {
            assert_eq!(CompareOp::Lt.apply(&a, &b), a < b);
            assert_eq!(CompareOp::Le.apply(&a, &b), a <= b);
            assert_eq!(CompareOp::Eq.apply(&a, &b), a == b);
            assert_eq!(CompareOp::Ne.apply(&a, &b), a != b);
            assert_eq!(CompareOp::Gt.apply(&a, &b), a > b);
            assert_eq!(CompareOp::Ge.apply(&a, &b), a >= b);
        }

        let nan = f64::NAN;
        assert!(!CompareOp::Eq.apply(&nan, &nan));
        assert!(CompareOp::Ne.apply(&nan, &nan));
        assert!(!CompareOp::Le.apply(&nan, &1.0));
    }

    #[test]
    fn test_profile_kind_ignores_c_events() {
        assert_eq!(ProfileKind::from_event("call"), Some(ProfileKind::Call));
        assert_eq!(ProfileKind::from_event("c_call"), None);
        assert_eq!(ProfileKind::from_event("c_return"), None);
    }
}
