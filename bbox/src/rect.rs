use super::XYXY;
use crate::common::*;

/// The generic axis-aligned rectangle. `y` grows downwards.
pub trait Rect {
    type Type;

    fn x1(&self) -> Self::Type;
    fn y1(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cxcywh(cxcywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn from_xyxy(xyxy: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_xyxy(xyxy).unwrap()
    }

    fn from_cxcywh(cxcywh: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_cxcywh(cxcywh).unwrap()
    }

    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x1(), self.y1(), self.x2(), self.y2()]
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.w() * self.h()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Overlapping region, or `None` when the rectangles do not intersect.
    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let x1 = self.x1().max(other.x1());
        let y1 = self.y1().max(other.y1());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 > x1 && y2 > y1).then(|| XYXY { x1, y1, x2, y2 })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union. Degenerate pairs with zero union yield zero.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let zero = Self::Type::zero();
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area().max(zero) + other.area().max(zero) - inter_area;

        if union_area <= zero {
            zero
        } else {
            inter_area / union_area
        }
    }

    /// Clamps the corners into `[0, max_x] x [0, max_y]`.
    fn clamp_to(&self, max_x: Self::Type, max_y: Self::Type) -> XYXY<Self::Type> {
        let zero = Self::Type::zero();
        let clamp = |value: Self::Type, max: Self::Type| value.max(zero).min(max);

        XYXY {
            x1: clamp(self.x1(), max_x),
            y1: clamp(self.y1(), max_y),
            x2: clamp(self.x2(), max_x),
            y2: clamp(self.y2(), max_y),
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CxCyWH;
    use approx::assert_abs_diff_eq;

    #[test]
    fn iou_of_identical_rects_is_one() {
        let lhs = XYXY::from_xyxy([1.0, 2.0, 5.0, 7.0]);
        let rhs = lhs.clone();
        assert_eq!(lhs.iou_with(&rhs), 1.0);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let lhs = XYXY::from_xyxy([0.0, 0.0, 1.0, 1.0]);
        let rhs = XYXY::from_xyxy([2.0, 2.0, 3.0, 3.0]);
        assert_eq!(lhs.iou_with(&rhs), 0.0);

        // touching edges do not overlap
        let rhs = XYXY::from_xyxy([1.0, 0.0, 2.0, 1.0]);
        assert_eq!(lhs.iou_with(&rhs), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let lhs = XYXY::from_xyxy([0.0, 0.0, 2.0, 2.0]);
        let rhs = XYXY::from_xyxy([1.0, 0.0, 3.0, 2.0]);
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 2.0 / 6.0);
    }

    #[test]
    fn iou_accepts_mixed_formats() {
        let lhs = XYXY::from_xyxy([0.0, 0.0, 4.0, 4.0]);
        let rhs = CxCyWH::from_cxcywh([2.0, 2.0, 4.0, 4.0]);
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 1.0);
    }

    #[test]
    fn inverted_rect_never_overlaps() {
        let lhs = XYXY::from_xyxy_unchecked([4.0, 4.0, 0.0, 0.0]);
        let rhs = XYXY::from_xyxy([0.0, 0.0, 4.0, 4.0]);
        assert!(lhs.intersect_with(&rhs).is_none());
        assert_eq!(lhs.iou_with(&rhs), 0.0);
        assert!(XYXY::try_from_xyxy([4.0, 4.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn clamp_into_image() {
        let rect = XYXY::from_xyxy([-3.0, 2.0, 12.0, 30.0]);
        assert_eq!(rect.clamp_to(10.0, 20.0).xyxy(), [0.0, 2.0, 10.0, 20.0]);
    }
}
