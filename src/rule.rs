//! Match rules: subscription predicates handed to the bus daemon.
//!
//! A rule only tells the bus which messages to deliver, client-side
//! routing is not affected by it.

use crate::message::MessageKind;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub kind: Option<MessageKind>,
    pub sender: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub eavesdrop: Option<bool>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal() -> Self {
        Self { kind: Some(MessageKind::Signal), ..Self::default() }
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn eavesdrop(mut self, eavesdrop: bool) -> Self {
        self.eavesdrop = Some(eavesdrop);
        self
    }

    /// The canonical `key='value',…` form the bus daemon parses.
    pub fn compile(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(kind) = self.kind {
            let literal = match kind {
                MessageKind::MethodCall => "method_call",
                MessageKind::MethodReturn => "method_return",
                MessageKind::Error => "error",
                MessageKind::Signal => "signal",
                MessageKind::Invalid => "",
            };
            if !literal.is_empty() {
                parts.push(format!("type='{literal}'"));
            }
        }
        let pairs = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                parts.push(format!("{key}='{value}'"));
            }
        }
        if let Some(eavesdrop) = self.eavesdrop {
            parts.push(format!("eavesdrop='{eavesdrop}'"));
        }
        parts.join(",")
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compile())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn canonical_encoding() {
        let rule = MatchRule::signal()
            .sender("org.freedesktop.DBus")
            .path("/org/freedesktop/DBus")
            .interface("org.freedesktop.DBus")
            .member("NameOwnerChanged");
        assert_eq!(
            rule.compile(),
            "type='signal',sender='org.freedesktop.DBus',path='/org/freedesktop/DBus',\
             interface='org.freedesktop.DBus',member='NameOwnerChanged'"
        );
    }

    #[test]
    fn empty_rule_compiles_to_nothing() {
        assert_eq!(MatchRule::new().compile(), "");
    }

    #[test]
    fn eavesdrop_and_namespace() {
        let rule = MatchRule::new().path_namespace("/com/example").eavesdrop(true);
        assert_eq!(rule.compile(), "path_namespace='/com/example',eavesdrop='true'");
    }
}
