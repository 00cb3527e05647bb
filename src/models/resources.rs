//! Multi dimensional resource vectors and their algebra
//!
//! Every quantity the scheduler accounts for (node capacity, queue usage,
//! pending asks) is a mapping from a resource type name to a non negative
//! amount. A dimension that is missing from the map counts as zero.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;

use crate::Error;

/// A vector of named resource quantities
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// The quantity for each resource type we are tracking
    resources: HashMap<String, u64>,
}

impl Resource {
    /// Create a new empty resource vector
    #[must_use]
    pub fn new() -> Self {
        Resource::default()
    }

    /// Create a resource vector from a map of quantities
    ///
    /// # Arguments
    ///
    /// * `resources` - The quantities to track by resource type name
    #[must_use]
    pub fn from_map(resources: HashMap<String, u64>) -> Self {
        Resource { resources }
    }

    /// Get the quantity for a single resource type
    ///
    /// A type that is not tracked counts as zero.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the resource type to get
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.resources.get(name).copied().unwrap_or(0)
    }

    /// Set the quantity for a single resource type
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the resource type to set
    /// * `quantity` - The quantity to set
    pub fn set<T: Into<String>>(&mut self, name: T, quantity: u64) {
        self.resources.insert(name.into(), quantity);
    }

    /// Iterate over the tracked resource types and their quantities
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.resources.iter()
    }

    /// Check if every tracked quantity is zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.resources.values().all(|quantity| *quantity == 0)
    }

    /// Check if at least one tracked quantity is above zero
    #[must_use]
    pub fn strictly_positive(&self) -> bool {
        self.resources.values().any(|quantity| *quantity > 0)
    }

    /// Check if we have enough resources to cover another vector
    ///
    /// Dimensions that are absent on both sides are ignored.
    ///
    /// # Arguments
    ///
    /// * `other` - The resources we need to cover
    #[must_use]
    pub fn enough(&self, other: &Resource) -> bool {
        // every dimension the other vector tracks must fit in ours
        other
            .resources
            .iter()
            .all(|(name, quantity)| self.get(name) >= *quantity)
    }

    /// Add another resource vector to this one
    ///
    /// # Arguments
    ///
    /// * `other` - The resources to add
    pub fn add_to(&mut self, other: &Resource) {
        // add each of the other vectors dimensions to ours
        for (name, quantity) in &other.resources {
            *self.resources.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    /// Subtract another resource vector from this one
    ///
    /// The subtraction is all or nothing: if any dimension would go negative
    /// then no dimension is changed and an error is returned.
    ///
    /// # Arguments
    ///
    /// * `other` - The resources to subtract
    pub fn sub_from(&mut self, other: &Resource) -> Result<(), Error> {
        // make sure no dimension would underflow before we mutate anything
        if !self.enough(other) {
            return Err(Error::Invariant(format!(
                "cannot subtract {} from {}",
                other, self
            )));
        }
        // all dimensions fit so apply the subtraction
        for (name, quantity) in &other.resources {
            if let Some(current) = self.resources.get_mut(name) {
                *current -= quantity;
            }
        }
        Ok(())
    }

    /// Add two resource vectors into a new one
    ///
    /// # Arguments
    ///
    /// * `left` - The left hand vector
    /// * `right` - The right hand vector
    #[must_use]
    pub fn add(left: &Resource, right: &Resource) -> Resource {
        let mut total = left.clone();
        total.add_to(right);
        total
    }

    /// Subtract one resource vector from another into a new one
    ///
    /// # Arguments
    ///
    /// * `left` - The vector to subtract from
    /// * `right` - The vector to subtract
    pub fn sub(left: &Resource, right: &Resource) -> Result<Resource, Error> {
        let mut remainder = left.clone();
        remainder.sub_from(right)?;
        Ok(remainder)
    }

    /// Scale this vector by a repeat count into a new one
    ///
    /// # Arguments
    ///
    /// * `count` - The number of repeats to scale by
    #[must_use]
    pub fn times(&self, count: u64) -> Resource {
        let mut scaled = self.clone();
        for quantity in scaled.resources.values_mut() {
            *quantity *= count;
        }
        scaled
    }

    /// Subtract another vector clamping every dimension at zero
    ///
    /// Used for derived quantities like node availability where an outside
    /// report can legitimately push a dimension to its floor.
    ///
    /// # Arguments
    ///
    /// * `other` - The resources to subtract
    #[must_use]
    pub fn sub_floor(&self, other: &Resource) -> Resource {
        let mut remainder = self.clone();
        for (name, quantity) in &other.resources {
            let current = remainder.resources.entry(name.clone()).or_insert(0);
            *current = current.saturating_sub(*quantity);
        }
        remainder
    }

    /// Calculate the used share of a maximum as per dimension percentages
    ///
    /// Dimensions with no maximum report zero usage.
    ///
    /// # Arguments
    ///
    /// * `max` - The maximum capacity to compare against
    /// * `used` - The currently used resources
    #[must_use]
    pub fn abs_used_capacity(max: &Resource, used: &Resource) -> Resource {
        let mut percentages = Resource::new();
        // calculate the used percentage for each dimension with a maximum
        for (name, total) in &max.resources {
            if *total > 0 {
                let share = (used.get(name) as f64 / *total as f64) * 100.0;
                percentages.set(name.clone(), share.round() as u64);
            } else {
                percentages.set(name.clone(), 0);
            }
        }
        percentages
    }
}

impl AddAssign<&Resource> for Resource {
    fn add_assign(&mut self, other: &Resource) {
        self.add_to(other);
    }
}

impl fmt::Display for Resource {
    /// Cleanly print a resource vector with stable dimension ordering
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // sort the dimensions so log lines are comparable
        let mut sorted: Vec<_> = self.resources.iter().collect();
        sorted.sort_by(|left, right| left.0.cmp(right.0));
        let rendered: Vec<String> = sorted
            .iter()
            .map(|(name, quantity)| format!("{name}:{quantity}"))
            .collect();
        write!(f, "[{}]", rendered.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a resource vector from literal pairs
    fn res(pairs: &[(&str, u64)]) -> Resource {
        let mut built = Resource::new();
        for (name, quantity) in pairs {
            built.set(*name, *quantity);
        }
        built
    }

    #[test]
    fn add_is_commutative_and_associative() {
        let a = res(&[("memory", 10), ("vcore", 2)]);
        let b = res(&[("memory", 5)]);
        let c = res(&[("vcore", 7), ("gpu", 1)]);
        assert_eq!(Resource::add(&a, &b), Resource::add(&b, &a));
        assert_eq!(
            Resource::add(&Resource::add(&a, &b), &c),
            Resource::add(&a, &Resource::add(&b, &c))
        );
    }

    #[test]
    fn sub_inverts_add() {
        let a = res(&[("memory", 10), ("vcore", 2)]);
        let b = res(&[("memory", 5), ("vcore", 1)]);
        let sum = Resource::add(&a, &b);
        assert!(sum.enough(&b));
        assert_eq!(Resource::sub(&sum, &b).unwrap(), a);
    }

    #[test]
    fn sub_underflow_leaves_vector_untouched() {
        let mut a = res(&[("memory", 10), ("vcore", 1)]);
        let too_big = res(&[("memory", 5), ("vcore", 2)]);
        assert!(a.sub_from(&too_big).is_err());
        // nothing may change on a failed subtraction
        assert_eq!(a, res(&[("memory", 10), ("vcore", 1)]));
    }

    #[test]
    fn enough_treats_missing_dimensions_as_zero() {
        let have = res(&[("memory", 10)]);
        assert!(have.enough(&res(&[("memory", 10)])));
        assert!(have.enough(&Resource::new()));
        assert!(!have.enough(&res(&[("vcore", 1)])));
        // a zero valued dimension on the ask side always fits
        assert!(have.enough(&res(&[("vcore", 0)])));
    }

    #[test]
    fn zero_checks() {
        assert!(Resource::new().is_zero());
        assert!(!Resource::new().strictly_positive());
        assert!(res(&[("memory", 0)]).is_zero());
        assert!(res(&[("memory", 1)]).strictly_positive());
    }

    #[test]
    fn scaling_and_floored_subtraction() {
        let ask = res(&[("memory", 10), ("vcore", 1)]);
        assert_eq!(ask.times(3), res(&[("memory", 30), ("vcore", 3)]));
        let capacity = res(&[("memory", 100)]);
        let consumed = res(&[("memory", 120), ("vcore", 4)]);
        assert_eq!(
            capacity.sub_floor(&consumed),
            res(&[("memory", 0), ("vcore", 0)])
        );
    }

    #[test]
    fn abs_used_capacity_handles_zero_max() {
        let max = res(&[("memory", 200), ("vcore", 0)]);
        let used = res(&[("memory", 50), ("vcore", 3)]);
        let shares = Resource::abs_used_capacity(&max, &used);
        assert_eq!(shares.get("memory"), 25);
        assert_eq!(shares.get("vcore"), 0);
    }
}
