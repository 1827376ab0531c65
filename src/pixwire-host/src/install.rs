//! Checks applied to procedures a plug-in asks to install.

use crate::error::ProcedureError;
use pixwire_wire::{array_rule_violation, ParamDef, ParamType, ProcInstall};
use std::fmt;

/// Menu a procedure is installed under, from the prefix of its menu path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuLocation {
    Toolbox,
    Image,
    Load,
    Save,
    ScriptFu,
}

impl MenuLocation {
    pub fn from_menu_path(path: &str) -> Option<Self> {
        const PREFIXES: [(&str, MenuLocation); 5] = [
            ("<Toolbox>", MenuLocation::Toolbox),
            ("<Image>", MenuLocation::Image),
            ("<Load>", MenuLocation::Load),
            ("<Save>", MenuLocation::Save),
            ("<sfm_menu>", MenuLocation::ScriptFu),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, location)| *location)
    }

    pub fn name(self) -> &'static str {
        match self {
            MenuLocation::Toolbox => "<Toolbox>",
            MenuLocation::Image => "<Image>",
            MenuLocation::Load => "<Load>",
            MenuLocation::Save => "<Save>",
            MenuLocation::ScriptFu => "<sfm_menu>",
        }
    }

    fn required(self) -> (&'static [ParamType], &'static str) {
        use ParamType::{Drawable, Image, Int32, String};
        match self {
            MenuLocation::Toolbox => (&[Int32], "Int32 run_mode"),
            MenuLocation::Image | MenuLocation::ScriptFu => {
                (&[Int32, Image, Drawable], "Int32 run_mode, Image, Drawable")
            }
            MenuLocation::Load => (&[Int32, String, String], "Int32 run_mode, String, String"),
            MenuLocation::Save => (
                &[Int32, Image, Drawable, String, String],
                "Int32 run_mode, Image, Drawable, String, String",
            ),
        }
    }
}

fn starts_with_kinds(params: &[ParamDef], kinds: &[ParamType]) -> bool {
    params.len() >= kinds.len()
        && params
            .iter()
            .zip(kinds)
            .all(|(param, kind)| param.kind == *kind)
}

/// Validates an install: menu-path argument shapes and the array rule for
/// both arguments and returns.
pub fn validate_install(install: &ProcInstall) -> Result<(), ProcedureError> {
    if let Some(menu_path) = install.menu_path.as_deref().filter(|path| !path.is_empty()) {
        let location = MenuLocation::from_menu_path(menu_path).ok_or_else(|| {
            ProcedureError::InvalidMenuLocation {
                name: install.name.clone(),
                menu_path: menu_path.to_string(),
            }
        })?;
        let (kinds, expected) = location.required();
        let fits = starts_with_kinds(&install.params, kinds)
            || (location == MenuLocation::ScriptFu
                && install.params.first().map(|p| p.kind) == Some(ParamType::Display));
        if !fits {
            return Err(ProcedureError::MenuArguments {
                name: install.name.clone(),
                location: location.name(),
                expected,
            });
        }
    }

    for (which, defs) in [("argument", &install.params), ("return value", &install.returns)] {
        if let Some(index) = array_rule_violation(defs.iter().map(|def| def.kind)) {
            return Err(ProcedureError::NonCompliantArray {
                name: install.name.clone(),
                which,
                index,
            });
        }
    }
    Ok(())
}

/// Set of image types a procedure accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ImageTypes(u32);

impl ImageTypes {
    pub const RGB: Self = Self(1 << 0);
    pub const RGBA: Self = Self(1 << 1);
    pub const GRAY: Self = Self(1 << 2);
    pub const GRAYA: Self = Self(1 << 3);
    pub const INDEXED: Self = Self(1 << 4);
    pub const INDEXEDA: Self = Self(1 << 5);
    pub const U16_RGB: Self = Self(1 << 6);
    pub const U16_RGBA: Self = Self(1 << 7);
    pub const U16_GRAY: Self = Self(1 << 8);
    pub const U16_GRAYA: Self = Self(1 << 9);
    pub const FLOAT_RGB: Self = Self(1 << 10);
    pub const FLOAT_RGBA: Self = Self(1 << 11);
    pub const FLOAT_GRAY: Self = Self(1 << 12);
    pub const FLOAT_GRAYA: Self = Self(1 << 13);
    pub const FLOAT16_RGB: Self = Self(1 << 14);
    pub const FLOAT16_RGBA: Self = Self(1 << 15);
    pub const FLOAT16_GRAY: Self = Self(1 << 16);
    pub const FLOAT16_GRAYA: Self = Self(1 << 17);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Parses a list such as `"RGB*, GRAY"`. Tokens are separated by spaces,
    /// tabs or commas; unknown tokens are skipped.
    pub fn parse(text: &str) -> Self {
        text.split([' ', '\t', ','])
            .filter(|token| !token.is_empty())
            .fold(Self::empty(), |types, token| match Self::from_token(token) {
                Some(bits) => types | bits,
                None => {
                    tracing::warn!(token, "unknown image type");
                    types
                }
            })
    }

    fn from_token(token: &str) -> Option<Self> {
        let (prefix, base) = ["U16_", "FLOAT16_", "FLOAT_"]
            .iter()
            .find_map(|prefix| token.strip_prefix(prefix).map(|rest| (*prefix, rest)))
            .unwrap_or(("", token));

        let (plain, alpha) = match prefix {
            "" => match base {
                "INDEXED" | "INDEXEDA" | "INDEXED*" => (Self::INDEXED, Self::INDEXEDA),
                _ => Self::family(base, Self::RGB, Self::RGBA, Self::GRAY, Self::GRAYA)?,
            },
            "U16_" => Self::family(
                base,
                Self::U16_RGB,
                Self::U16_RGBA,
                Self::U16_GRAY,
                Self::U16_GRAYA,
            )?,
            "FLOAT_" => Self::family(
                base,
                Self::FLOAT_RGB,
                Self::FLOAT_RGBA,
                Self::FLOAT_GRAY,
                Self::FLOAT_GRAYA,
            )?,
            _ => Self::family(
                base,
                Self::FLOAT16_RGB,
                Self::FLOAT16_RGBA,
                Self::FLOAT16_GRAY,
                Self::FLOAT16_GRAYA,
            )?,
        };

        let suffix = base
            .strip_prefix("INDEXED")
            .or_else(|| base.strip_prefix("RGB"))
            .or_else(|| base.strip_prefix("GRAY"));
        match suffix {
            Some("") => Some(plain),
            Some("A") => Some(alpha),
            Some("*") => Some(plain | alpha),
            _ => None,
        }
    }

    fn family(base: &str, rgb: Self, rgba: Self, gray: Self, graya: Self) -> Option<(Self, Self)> {
        if base.starts_with("RGB") {
            Some((rgb, rgba))
        } else if base.starts_with("GRAY") {
            Some((gray, graya))
        } else {
            None
        }
    }
}

impl std::ops::BitOr for ImageTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ImageTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ImageTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ImageTypes, &str); 18] = [
            (ImageTypes::RGB, "RGB"),
            (ImageTypes::RGBA, "RGBA"),
            (ImageTypes::GRAY, "GRAY"),
            (ImageTypes::GRAYA, "GRAYA"),
            (ImageTypes::INDEXED, "INDEXED"),
            (ImageTypes::INDEXEDA, "INDEXEDA"),
            (ImageTypes::U16_RGB, "U16_RGB"),
            (ImageTypes::U16_RGBA, "U16_RGBA"),
            (ImageTypes::U16_GRAY, "U16_GRAY"),
            (ImageTypes::U16_GRAYA, "U16_GRAYA"),
            (ImageTypes::FLOAT_RGB, "FLOAT_RGB"),
            (ImageTypes::FLOAT_RGBA, "FLOAT_RGBA"),
            (ImageTypes::FLOAT_GRAY, "FLOAT_GRAY"),
            (ImageTypes::FLOAT_GRAYA, "FLOAT_GRAYA"),
            (ImageTypes::FLOAT16_RGB, "FLOAT16_RGB"),
            (ImageTypes::FLOAT16_RGBA, "FLOAT16_RGBA"),
            (ImageTypes::FLOAT16_GRAY, "FLOAT16_GRAY"),
            (ImageTypes::FLOAT16_GRAYA, "FLOAT16_GRAYA"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bits, _)| self.contains(*bits))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(menu: Option<&str>, params: &[ParamType]) -> ProcInstall {
        let mut install = ProcInstall::new("plug_in_test", pixwire_wire::ProcKind::Plugin);
        install.menu_path = menu.map(str::to_string);
        install.params = params
            .iter()
            .map(|kind| ParamDef::new(*kind, kind.name(), ""))
            .collect();
        install
    }

    #[test]
    fn image_menu_needs_three_arguments() {
        let short = install(Some("<Image>/Filters/Blur"), &[ParamType::Int32, ParamType::Image]);
        assert!(matches!(
            validate_install(&short),
            Err(ProcedureError::MenuArguments { location: "<Image>", .. })
        ));

        let full = install(
            Some("<Image>/Filters/Blur"),
            &[ParamType::Int32, ParamType::Image, ParamType::Drawable, ParamType::Float],
        );
        assert!(validate_install(&full).is_ok());
    }

    #[test]
    fn each_location_checks_its_shape() {
        use ParamType::*;
        let cases: &[(&str, &[ParamType], bool)] = &[
            ("<Toolbox>/Xtns/Browser", &[Int32], true),
            ("<Toolbox>/Xtns/Browser", &[], false),
            ("<Load>/PNG", &[Int32, String, String], true),
            ("<Load>/PNG", &[Int32, String], false),
            ("<Save>/PNG", &[Int32, Image, Drawable, String, String], true),
            ("<Save>/PNG", &[Int32, Image, Drawable, String], false),
            ("<sfm_menu>/Script", &[Display], true),
            ("<sfm_menu>/Script", &[Int32, Image, Drawable], true),
            ("<sfm_menu>/Script", &[Int32], false),
        ];
        for (menu, params, ok) in cases {
            assert_eq!(
                validate_install(&install(Some(menu), params)).is_ok(),
                *ok,
                "{menu} {params:?}"
            );
        }
    }

    #[test]
    fn unknown_menu_prefix_is_rejected() {
        let err =
            validate_install(&install(Some("<Layers>/Thing"), &[ParamType::Int32])).unwrap_err();
        assert!(matches!(err, ProcedureError::InvalidMenuLocation { .. }));
        // No menu path means no location check.
        assert!(validate_install(&install(None, &[])).is_ok());
    }

    #[test]
    fn arrays_need_a_preceding_count() {
        use ParamType::*;
        let bad = install(None, &[Int32, Float, Int16Array]);
        assert!(matches!(
            validate_install(&bad),
            Err(ProcedureError::NonCompliantArray { which: "argument", index: 2, .. })
        ));
        let first = install(None, &[StringArray]);
        assert!(validate_install(&first).is_err());

        let mut returns = install(None, &[Int32, Int32Array]);
        assert!(validate_install(&returns).is_ok());
        returns.returns = vec![ParamDef::new(FloatArray, "values", "")];
        assert!(matches!(
            validate_install(&returns),
            Err(ProcedureError::NonCompliantArray { which: "return value", index: 0, .. })
        ));
    }

    #[test]
    fn image_types_parse_wildcards_and_prefixes() {
        let types = ImageTypes::parse("RGB*, GRAY\tINDEXEDA");
        assert!(types.contains(ImageTypes::RGB | ImageTypes::RGBA));
        assert!(types.contains(ImageTypes::GRAY));
        assert!(!types.contains(ImageTypes::GRAYA));
        assert!(types.contains(ImageTypes::INDEXEDA));
        assert!(!types.contains(ImageTypes::INDEXED));

        let deep = ImageTypes::parse("U16_RGB,FLOAT_GRAY* FLOAT16_RGBA");
        assert_eq!(
            deep,
            ImageTypes::U16_RGB
                | ImageTypes::FLOAT_GRAY
                | ImageTypes::FLOAT_GRAYA
                | ImageTypes::FLOAT16_RGBA
        );
        assert_eq!(deep.to_string(), "U16_RGB, FLOAT_GRAY, FLOAT_GRAYA, FLOAT16_RGBA");
    }

    #[test]
    fn unknown_image_tokens_are_skipped() {
        assert_eq!(ImageTypes::parse("CMYK, RGB"), ImageTypes::RGB);
        assert!(ImageTypes::parse("").is_empty());
        assert!(ImageTypes::parse("U16_INDEXED").is_empty());
    }
}
