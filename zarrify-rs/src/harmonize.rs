//! Axis harmonization: put the time axis first.
//!
//! The MATLAB suite exports each quantity with its own axis convention depending
//! on the analysis family (`DBA`, `AOA`, ...) encoded in the containing folder
//! name. There is no general rule, only this ordered table; the first rule that
//! matches decides. Some rules overlap or shadow later ones and are kept as is so
//! stores stay compatible with those produced by earlier tooling.

use ndarray::{ArrayD, IxDyn};

use crate::error::{Error, Result};

/// Velocity and strain fields.
pub const VELOCITY_FIELDS: &[&str] = &["EpsilonPIV", "UPIV"];
/// Area-ratio style fields as exported inside `AOA` folders.
pub const AREA_FIELDS_AOA: &[&str] = &["OmegaPIV", "AreaRatios"];
/// Area-ratio style fields elsewhere.
pub const AREA_FIELDS: &[&str] = &["OmegaPIV", "AreaRatios", "AreaRatios_VM"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankFilter {
    Exactly(usize),
    Above(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFilter {
    Any,
    Contains(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameFilter {
    Any,
    In(&'static [&'static str]),
    NotIn(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Identity,
    /// numpy `moveaxis(a, axis, 0)`.
    MoveToFront(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub rank: RankFilter,
    pub group: GroupFilter,
    pub name: NameFilter,
    pub action: Action,
}

impl Rule {
    const fn new(rank: RankFilter, group: GroupFilter, name: NameFilter, action: Action) -> Self {
        Rule {
            rank,
            group,
            name,
            action,
        }
    }

    pub fn matches(&self, rank: usize, quantity: &str, group: &str) -> bool {
        let rank_ok = match self.rank {
            RankFilter::Exactly(r) => rank == r,
            RankFilter::Above(r) => rank > r,
        };
        let group_ok = match self.group {
            GroupFilter::Any => true,
            GroupFilter::Contains(hint) => group.contains(hint),
        };
        let name_ok = match self.name {
            NameFilter::Any => true,
            NameFilter::In(names) => names.contains(&quantity),
            NameFilter::NotIn(names) => !names.contains(&quantity),
        };
        rank_ok && group_ok && name_ok
    }
}

use Action::{Identity, MoveToFront};
use GroupFilter::{Any as AnyGroup, Contains};
use NameFilter::{Any as AnyName, In, NotIn};
use RankFilter::{Above, Exactly};

pub const RULES: [Rule; 12] = [
    Rule::new(Exactly(2), AnyGroup, AnyName, Identity),
    Rule::new(Exactly(3), Contains("DBA"), NotIn(VELOCITY_FIELDS), MoveToFront(2)),
    Rule::new(Exactly(3), Contains("AOA"), AnyName, Identity),
    Rule::new(Exactly(3), AnyGroup, AnyName, MoveToFront(2)),
    Rule::new(Exactly(4), Contains("DBA"), AnyName, MoveToFront(3)),
    Rule::new(Exactly(4), Contains("AOA"), In(VELOCITY_FIELDS), Identity),
    Rule::new(Exactly(4), Contains("AOA"), In(AREA_FIELDS_AOA), MoveToFront(2)),
    Rule::new(Exactly(4), Contains("AOA"), AnyName, MoveToFront(3)),
    Rule::new(Exactly(4), AnyGroup, In(VELOCITY_FIELDS), MoveToFront(3)),
    Rule::new(Exactly(4), AnyGroup, In(AREA_FIELDS), MoveToFront(2)),
    Rule::new(Exactly(4), AnyGroup, AnyName, MoveToFront(3)),
    Rule::new(Above(4), AnyGroup, AnyName, MoveToFront(3)),
];

/// Index into [`RULES`] of the first rule matching the context.
pub fn matching_rule(rank: usize, quantity: &str, group: &str) -> Option<usize> {
    RULES.iter().position(|r| r.matches(rank, quantity, group))
}

/// Reorder `array` so its time axis comes first.
pub fn harmonize<T>(array: ArrayD<T>, quantity: &str, group: &str) -> Result<ArrayD<T>> {
    let rank = array.ndim();
    if rank < 2 {
        return Err(Error::Shape(format!(
            "{quantity} has {rank} dimension(s), at least two are needed"
        )));
    }
    let action = matching_rule(rank, quantity, group)
        .map(|i| RULES[i].action)
        .unwrap_or(Identity);
    Ok(match action {
        Identity => array,
        MoveToFront(axis) => move_axis_to_front(array, axis),
    })
}

/// Move `axis` to position 0 keeping the other axes in order.
pub fn move_axis_to_front<T>(array: ArrayD<T>, axis: usize) -> ArrayD<T> {
    let mut order: Vec<usize> = (0..array.ndim()).filter(|&a| a != axis).collect();
    order.insert(0, axis);
    array.permuted_axes(IxDyn(&order))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaped(shape: &[usize]) -> ArrayD<f64> {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f64).collect()).unwrap()
    }

    fn out_shape(shape: &[usize], quantity: &str, group: &str) -> Vec<usize> {
        harmonize(shaped(shape), quantity, group).unwrap().shape().to_vec()
    }

    #[test]
    fn every_rule_is_reachable_in_order() {
        let cases: [(usize, &str, &str, usize); 12] = [
            (2, "UPIV", "DBA_1", 0),
            (3, "OmegaPIV", "DBA_1", 1),
            (3, "UPIV", "AOA_1", 2),
            (3, "UPIV", "DBA_AOA", 2),
            (3, "UPIV", "Cells", 3),
            (4, "UPIV", "DBA_1", 4),
            (4, "EpsilonPIV", "AOA_1", 5),
            (4, "AreaRatios", "AOA_1", 6),
            (4, "AreaRatios_VM", "AOA_1", 7),
            (4, "UPIV", "Cells", 8),
            (4, "AreaRatios_VM", "Cells", 9),
            (4, "Other", "Cells", 10),
        ];
        for (rank, quantity, group, expected) in cases {
            assert_eq!(
                matching_rule(rank, quantity, group),
                Some(expected),
                "rank {rank} {quantity} in {group}"
            );
        }
        assert_eq!(matching_rule(5, "UPIV", "AOA_1"), Some(11));
        assert_eq!(matching_rule(1, "UPIV", "AOA_1"), None);
    }

    #[test]
    fn vorticity_in_aoa_is_unchanged() {
        assert_eq!(out_shape(&[2, 3, 4, 5], "EpsilonPIV", "AOA_x"), vec![2, 3, 4, 5]);
    }

    #[test]
    fn vorticity_in_dba_moves_time_first() {
        let a = shaped(&[2, 3, 4, 5]);
        let h = harmonize(a.clone(), "EpsilonPIV", "DBA_y").unwrap();
        assert_eq!(h.shape(), &[5, 2, 3, 4]);
        assert_eq!(h[[4, 1, 2, 3]], a[[1, 2, 3, 4]]);
    }

    #[test]
    fn rank_three_rules() {
        assert_eq!(out_shape(&[2, 3, 7], "OmegaPIV", "DBA_1"), vec![7, 2, 3]);
        // Velocity in DBA falls through to the AOA / catch-all rules.
        assert_eq!(out_shape(&[2, 3, 7], "UPIV", "DBA_1"), vec![7, 2, 3]);
        assert_eq!(out_shape(&[2, 3, 7], "OmegaPIV", "AOA_1"), vec![2, 3, 7]);
        assert_eq!(out_shape(&[2, 3, 7], "Other", "Cells"), vec![7, 2, 3]);
    }

    #[test]
    fn rank_four_area_ratios_move_third_axis() {
        assert_eq!(out_shape(&[2, 3, 7, 5], "OmegaPIV", "AOA_1"), vec![7, 2, 3, 5]);
        assert_eq!(out_shape(&[2, 3, 7, 5], "AreaRatios_VM", "AOA_1"), vec![5, 2, 3, 7]);
        assert_eq!(out_shape(&[2, 3, 7, 5], "AreaRatios_VM", "Cells"), vec![7, 2, 3, 5]);
        assert_eq!(out_shape(&[2, 3, 7, 5], "UPIV", "Cells"), vec![5, 2, 3, 7]);
    }

    #[test]
    fn rank_two_and_five() {
        assert_eq!(out_shape(&[3, 4], "UPIV", "DBA_1"), vec![3, 4]);
        assert_eq!(out_shape(&[2, 3, 4, 5, 6], "UPIV", "AOA_1"), vec![5, 2, 3, 4, 6]);
    }

    #[test]
    fn rank_below_two_is_rejected() {
        assert!(matches!(
            harmonize(shaped(&[4]), "UPIV", "AOA_1"),
            Err(Error::Shape(_))
        ));
    }
}
