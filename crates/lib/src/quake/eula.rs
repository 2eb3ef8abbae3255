//! Quake III Arena demo license gate.

use crate::error::{Error, Result};

pub const Q3_DEMO_EULA: &str = "\
QUAKE III ARENA DEMO
LIMITED USE SOFTWARE LICENSE AGREEMENT

The game data served by this program is the Quake III Arena demo, published by
id Software, Inc. and licensed under its Limited Use Software License
Agreement. The demo is licensed for personal, non-commercial use. It may not be
sold, rented, modified or redistributed except as that agreement permits, and
it is provided \"as is\" without warranty of any kind.

Read the full agreement distributed with the demo before continuing. Run again
with --agree-eula to confirm that you accept its terms.
";

/// Fails unless the operator has accepted the demo license.
pub fn require_agreement(agreed: bool) -> Result<()> {
    if agreed {
        Ok(())
    } else {
        Err(Error::EulaNotAccepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_without_agreement() {
        assert!(matches!(require_agreement(false), Err(Error::EulaNotAccepted)));
        assert!(require_agreement(true).is_ok());
        assert!(Q3_DEMO_EULA.contains("--agree-eula"));
    }
}
