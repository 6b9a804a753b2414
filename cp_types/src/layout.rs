use serde::{Deserialize, Serialize};

/// Directory dialect produced by an instrument software revision.
///
/// Each variant is a descriptor: it fixes how many directory levels sit
/// between a plate directory and its image files, how many trailing path
/// segments survive truncation, and where the plate name and plate number
/// live within a path. Supporting a new instrument layout means adding a
/// variant and its descriptor values here, nothing else.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum PathLayout {
    /// `{plate}/{date}/{plate_num}/{image}`
    #[default]
    Legacy,
    /// `{plate}/{date}/{plate_num}/{timepoint}/{image}`
    NewIx,
}

impl PathLayout {
    pub fn from_new_ix(new_ix: bool) -> PathLayout {
        if new_ix {
            PathLayout::NewIx
        } else {
            PathLayout::Legacy
        }
    }

    /// Number of directory levels between the plate directory and the images.
    pub fn glob_depth(self) -> usize {
        match self {
            PathLayout::Legacy => 3,
            PathLayout::NewIx => 4,
        }
    }

    /// Number of trailing path segments kept when truncating an image path
    /// to its plate-relative form (plate name through filename).
    pub fn truncate_len(self) -> usize {
        self.glob_depth() + 1
    }

    /// Position of the plate-name segment, counting back from the filename
    /// (the filename itself is 1).
    pub fn plate_name_offset(self) -> usize {
        self.glob_depth() + 1
    }

    /// Position of the plate-number segment, counting back from the filename.
    pub fn plate_num_offset(self) -> usize {
        match self {
            PathLayout::Legacy => 2,
            PathLayout::NewIx => 3,
        }
    }
}
