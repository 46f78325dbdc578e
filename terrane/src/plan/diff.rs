//! Deciding the action for one resource instance.

use terrane_core::value::{AttrPath, Value};

use super::{Action, PlanMode, ReplaceOrder};

pub struct ActionInput<'a> {
    pub mode: PlanMode,
    /// The refreshed prior object, if there is one.
    pub prior: Option<&'a Value>,
    /// The provider's planned value for the configuration, if the instance is
    /// still configured.
    pub planned: Option<&'a Value>,
    pub requires_replace: &'a [AttrPath],
    pub tainted: bool,
    pub create_before_destroy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub replace_order: Option<ReplaceOrder>,
}

pub fn decide_action(input: &ActionInput) -> Decision {
    let action = match (input.mode, input.prior, input.planned) {
        (PlanMode::RefreshOnly, _, _) => Action::NoOp,
        (_, None, None) => Action::NoOp,
        (_, None, Some(_)) => Action::Create,
        (_, Some(_), None) => Action::Delete,
        (_, Some(_), Some(_)) if input.tainted => Action::Replace,
        // Any attribute that cannot change in place forces a replace, even if
        // other attributes could be updated.
        (_, Some(_), Some(_)) if !input.requires_replace.is_empty() => Action::Replace,
        (_, Some(prior), Some(planned)) if prior == planned => Action::NoOp,
        (_, Some(_), Some(_)) => Action::Update,
    };
    let replace_order = (action == Action::Replace).then_some(if input.create_before_destroy {
        ReplaceOrder::CreateThenDelete
    } else {
        ReplaceOrder::DeleteThenCreate
    });
    Decision {
        action,
        replace_order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decide(
        prior: Option<serde_json::Value>,
        planned: Option<Value>,
        requires_replace: &[&str],
    ) -> Action {
        let prior = prior.map(Value::from_json);
        let requires_replace: Vec<AttrPath> =
            requires_replace.iter().map(|a| AttrPath::attr(a)).collect();
        decide_action(&ActionInput {
            mode: PlanMode::Normal,
            prior: prior.as_ref(),
            planned: planned.as_ref(),
            requires_replace: &requires_replace,
            tainted: false,
            create_before_destroy: false,
        })
        .action
    }

    #[test]
    fn basic_actions() {
        let v = || Value::from_json(json!({"size": 1}));
        assert_eq!(decide(None, Some(v()), &[]), Action::Create);
        assert_eq!(decide(Some(json!({"size": 1})), None, &[]), Action::Delete);
        assert_eq!(decide(Some(json!({"size": 1})), Some(v()), &[]), Action::NoOp);
        assert_eq!(decide(Some(json!({"size": 2})), Some(v()), &[]), Action::Update);
        assert_eq!(decide(None, None, &[]), Action::NoOp);
    }

    #[test]
    fn replacement_wins_over_update() {
        let planned = Value::from_json(json!({"size": 2, "zone": "b"}));
        assert_eq!(
            decide(Some(json!({"size": 1, "zone": "a"})), Some(planned), &["zone"]),
            Action::Replace
        );
    }

    #[test]
    fn unknown_attributes_are_an_update() {
        let planned = Value::object([("size", Value::Unknown)]);
        assert_eq!(decide(Some(json!({"size": 1})), Some(planned), &[]), Action::Update);
    }

    #[test]
    fn replace_order_and_taint() {
        let prior = Value::from_json(json!({"size": 1}));
        let mut input = ActionInput {
            mode: PlanMode::Normal,
            prior: Some(&prior),
            planned: Some(&prior),
            requires_replace: &[],
            tainted: true,
            create_before_destroy: true,
        };
        assert_eq!(
            decide_action(&input),
            Decision {
                action: Action::Replace,
                replace_order: Some(ReplaceOrder::CreateThenDelete)
            }
        );
        input.create_before_destroy = false;
        assert_eq!(
            decide_action(&input).replace_order,
            Some(ReplaceOrder::DeleteThenCreate)
        );
        input.mode = PlanMode::RefreshOnly;
        assert_eq!(decide_action(&input).action, Action::NoOp);
        assert_eq!(decide_action(&input).replace_order, None);
    }
}
