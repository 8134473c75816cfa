//! Pyramid level definitions.
//!
//! A [`LevelSet`] is the ordered list of resolution/quality tiers a pyramid
//! is built from, lowest first. Max widths never decrease with rank, which is
//! what lets a failed level fall back to the one below it.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::LevelError;
use crate::tile::encoder::{is_valid_quality, scaled_height};

/// One tier of the pyramid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidLevel {
    pub name: String,
    pub max_width: u32,
    pub quality: u8,
}

impl PyramidLevel {
    pub fn new(name: impl Into<String>, max_width: u32, quality: u8) -> Self {
        Self {
            name: name.into(),
            max_width,
            quality,
        }
    }

    /// Pixel size of this level for a `width`x`height` source. Never larger
    /// than the source.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_width {
            (width, height)
        } else {
            (self.max_width, scaled_height(width, height, self.max_width))
        }
    }
}

impl fmt::Display for PyramidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.max_width, self.quality)
    }
}

impl FromStr for PyramidLevel {
    type Err = LevelError;

    /// Parse `name:max_width:quality`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || LevelError::Malformed(s.to_string());
        let mut parts = s.trim().split(':');
        let (Some(name), Some(width), Some(quality), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let max_width = width.trim().parse::<u32>().map_err(|_| malformed())?;
        let quality = quality.trim().parse::<u32>().map_err(|_| malformed())?;
        let name = name.trim();
        if !is_valid_quality(quality) {
            return Err(LevelError::InvalidQuality {
                name: name.to_string(),
                quality,
            });
        }
        Ok(Self::new(name, max_width, quality as u8))
    }
}

/// Ordered, validated pyramid levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LevelSet {
    levels: Vec<PyramidLevel>,
}

impl LevelSet {
    pub fn new(levels: Vec<PyramidLevel>) -> Result<Self, LevelError> {
        if levels.is_empty() {
            return Err(LevelError::Empty);
        }
        let mut previous: Option<&PyramidLevel> = None;
        for (i, level) in levels.iter().enumerate() {
            let valid_name = !level.name.is_empty()
                && level
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
            if !valid_name {
                return Err(LevelError::InvalidName(level.name.clone()));
            }
            if levels[..i].iter().any(|l| l.name == level.name) {
                return Err(LevelError::Duplicate(level.name.clone()));
            }
            if !is_valid_quality(u32::from(level.quality)) {
                return Err(LevelError::InvalidQuality {
                    name: level.name.clone(),
                    quality: u32::from(level.quality),
                });
            }
            if level.max_width == 0 {
                return Err(LevelError::InvalidWidth {
                    name: level.name.clone(),
                    max_width: 0,
                });
            }
            if let Some(prev) = previous {
                if level.max_width < prev.max_width {
                    return Err(LevelError::NotMonotonic {
                        name: level.name.clone(),
                        max_width: level.max_width,
                        previous: prev.max_width,
                    });
                }
            }
            previous = Some(level);
        }
        Ok(Self { levels })
    }

    /// Parse a comma-separated list of `name:max_width:quality`.
    pub fn parse(spec: &str) -> Result<Self, LevelError> {
        let levels = spec
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<PyramidLevel>, _>>()?;
        Self::new(levels)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PyramidLevel> {
        self.levels.iter()
    }

    pub fn get(&self, name: &str) -> Option<&PyramidLevel> {
        self.levels.iter().find(|l| l.name == name)
    }

    /// Position of `name`, 0 being the lowest level.
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.name == name)
    }

    pub fn lowest(&self) -> &PyramidLevel {
        &self.levels[0]
    }

    pub fn highest(&self) -> &PyramidLevel {
        &self.levels[self.levels.len() - 1]
    }

    /// `name` followed by every lower level, nearest first.
    pub fn fallback_chain(&self, name: &str) -> Option<impl Iterator<Item = &PyramidLevel>> {
        let rank = self.rank(name)?;
        Some(self.levels[..=rank].iter().rev())
    }

    /// Smallest level at least `display_width` wide, else the highest.
    pub fn for_display_width(&self, display_width: u32) -> &PyramidLevel {
        self.levels
            .iter()
            .find(|l| l.max_width >= display_width)
            .unwrap_or_else(|| self.highest())
    }
}

impl Default for LevelSet {
    fn default() -> Self {
        Self {
            levels: vec![
                PyramidLevel::new("instant", 400, 60),
                PyramidLevel::new("quick", 800, 75),
                PyramidLevel::new("detailed", 1200, 85),
                PyramidLevel::new("full", 2000, 95),
            ],
        }
    }
}

impl fmt::Display for LevelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", level)?;
        }
        Ok(())
    }
}
