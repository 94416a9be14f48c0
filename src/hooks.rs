//! Named hook locations in a transformer forward pass
//!
//! Follows the TransformerLens naming convention so configs can refer to
//! hook points by string (`"blocks.8.hook_resid_post"`).

use std::fmt;
use std::str::FromStr;

/// Location in a forward pass whose activations can be captured.
///
/// Unknown strings parse as [`HookPoint::Custom`] so backend-specific hooks
/// still round-trip through configs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token/patch embedding (`hook_embed`)
    Embed,
    /// Residual stream before block `i` (`blocks.{i}.hook_resid_pre`)
    ResidPre(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`)
    ResidMid(usize),
    /// Residual stream after block `i` (`blocks.{i}.hook_resid_post`)
    ResidPost(usize),
    /// Attention output of block `i` (`blocks.{i}.hook_attn_out`)
    AttnOut(usize),
    /// MLP output of block `i` (`blocks.{i}.hook_mlp_out`)
    MlpOut(usize),
    Custom(String),
}

impl HookPoint {
    /// Block index the hook belongs to, if any
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::ResidMid(i)
            | Self::ResidPost(i)
            | Self::AttnOut(i)
            | Self::MlpOut(i) => Some(*i),
            Self::Embed | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

fn parse_hook_string(s: &str) -> HookPoint {
    if s == "hook_embed" {
        return HookPoint::Embed;
    }

    if let Some((layer_str, suffix)) = s.strip_prefix("blocks.").and_then(|r| r.split_once('.')) {
        if let Ok(layer) = layer_str.parse::<usize>() {
            return match suffix {
                "hook_resid_pre" => HookPoint::ResidPre(layer),
                "hook_resid_mid" => HookPoint::ResidMid(layer),
                "hook_resid_post" => HookPoint::ResidPost(layer),
                "hook_attn_out" => HookPoint::AttnOut(layer),
                "hook_mlp_out" => HookPoint::MlpOut(layer),
                _ => HookPoint::Custom(s.to_string()),
            };
        }
    }

    HookPoint::Custom(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_round_trip() {
        for hook in [
            HookPoint::Embed,
            HookPoint::ResidPre(0),
            HookPoint::ResidMid(3),
            HookPoint::ResidPost(11),
            HookPoint::AttnOut(2),
            HookPoint::MlpOut(7),
        ] {
            let parsed: HookPoint = hook.to_string().parse().unwrap();
            assert_eq!(parsed, hook);
        }
    }

    #[test]
    fn test_hook_custom_fallback() {
        let hook = HookPoint::from("blocks.x.hook_resid_post");
        assert_eq!(hook, HookPoint::Custom("blocks.x.hook_resid_post".into()));
        assert_eq!(HookPoint::from("blocks.4.attn.hook_z").layer(), None);
        assert_eq!(HookPoint::ResidPost(9).layer(), Some(9));
    }
}
