//! Workspace-backed report models. Loads a scope from SQLite and runs it
//! through the resolver, final-grade and statistics stages.

use super::formula::ArithmeticEvaluator;
use super::grades::{final_grade, student_annual, subject_annual, GradingPolicy, StudentAnnual};
use super::resolver::{resolve_components, EvaluationComponent, RecordedScore};
use super::stats::{class_statistics, ClassStatistics};
use super::{CalcError, ResolvedGrade};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const TRIMESTERS: [i64; 3] = [1, 2, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    Active,
    Inactive,
    Blocked,
}

impl StudentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Blocked => "blocked",
        }
    }
}

/// Which students a listing or report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentStatusFilter {
    #[default]
    Active,
    Inactive,
    Blocked,
    All,
}

impl StudentStatusFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "blocked" => Some(Self::Blocked),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Blocked => "blocked",
            Self::All => "all",
        }
    }

    pub fn matches(self, status: StudentStatus) -> bool {
        match self {
            Self::Active => status == StudentStatus::Active,
            Self::Inactive => status == StudentStatus::Inactive,
            Self::Blocked => status == StudentStatus::Blocked,
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub subject_id: &'a str,
    pub trimester: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub id: String,
    pub code: String,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub student_no: Option<String>,
    pub status: StudentStatus,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    #[serde(flatten)]
    pub component: EvaluationComponent,
    pub subject_id: String,
    pub trimester: i64,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeRow {
    pub student_id: String,
    pub display_name: String,
    pub status: StudentStatus,
    pub sort_order: i64,
    pub values: BTreeMap<String, f64>,
    pub recorded_count: usize,
    pub grade: ResolvedGrade,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterSummary {
    pub class: ClassSummary,
    pub subject: SubjectSummary,
    pub trimester: i64,
    pub policy: GradingPolicy,
    pub student_status: &'static str,
    pub components: Vec<ComponentDef>,
    #[serde(rename = "perStudent")]
    pub per_student: Vec<StudentGradeRow>,
    pub statistics: ClassStatistics,
    pub not_available_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualStudentRow {
    pub student_id: String,
    pub display_name: String,
    pub status: StudentStatus,
    pub sort_order: i64,
    #[serde(flatten)]
    pub outcome: StudentAnnual,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAnnualStats {
    pub subject: SubjectSummary,
    pub transita_count: usize,
    pub statistics: ClassStatistics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualSummary {
    pub class: ClassSummary,
    pub subjects: Vec<SubjectSummary>,
    pub policy: GradingPolicy,
    pub student_status: &'static str,
    #[serde(rename = "perStudent")]
    pub per_student: Vec<AnnualStudentRow>,
    #[serde(rename = "perSubject")]
    pub per_subject: Vec<SubjectAnnualStats>,
    pub overall: ClassStatistics,
    pub promoted_count: usize,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassSummary, CalcError> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    let Some(name) = name else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    Ok(ClassSummary {
        id: class_id.to_string(),
        name,
    })
}

pub fn load_subjects(conn: &Connection, class_id: &str) -> Result<Vec<SubjectSummary>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, sort_order
             FROM subjects
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let subjects = stmt
        .query_map([class_id], |r| {
            Ok(SubjectSummary {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                sort_order: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(subjects)
}

pub fn load_subject(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> Result<SubjectSummary, CalcError> {
    conn.query_row(
        "SELECT id, code, name, sort_order FROM subjects WHERE id = ? AND class_id = ?",
        (subject_id, class_id),
        |r| {
            Ok(SubjectSummary {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                sort_order: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| CalcError::new("not_found", "subject not found"))
}

pub fn load_students(
    conn: &Connection,
    class_id: &str,
    filter: StudentStatusFilter,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, status, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let status: String = r.get(4)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                student_no: r.get(3)?,
                // Unknown historical values are treated as active.
                status: StudentStatus::parse(&status).unwrap_or(StudentStatus::Active),
                sort_order: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows.into_iter().filter(|s| filter.matches(s.status)).collect())
}

pub fn load_scope_components(
    conn: &Connection,
    subject_id: &str,
    trimester: i64,
) -> Result<Vec<ComponentDef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, weight_percent, is_calculated, formula_expression, sort_order
             FROM components
             WHERE subject_id = ? AND trimester = ?
             ORDER BY sort_order, code",
        )
        .map_err(db_err)?;
    let mut defs: Vec<ComponentDef> = stmt
        .query_map((subject_id, trimester), |r| {
            Ok(ComponentDef {
                component: EvaluationComponent {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    weight_percent: r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    is_calculated: r.get::<_, i64>(4)? != 0,
                    formula_expression: r.get(5)?,
                    depends_on: Vec::new(),
                },
                subject_id: subject_id.to_string(),
                trimester,
                name: r.get(2)?,
                sort_order: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut deps_stmt = conn
        .prepare(
            "SELECT d.component_id, d.depends_on_id
             FROM component_deps d
             JOIN components c ON c.id = d.component_id
             WHERE c.subject_id = ? AND c.trimester = ?
             ORDER BY d.component_id, d.position",
        )
        .map_err(db_err)?;
    let edges = deps_stmt
        .query_map((subject_id, trimester), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    let mut deps_by_component: HashMap<String, Vec<String>> = HashMap::new();
    for (component_id, depends_on_id) in edges {
        deps_by_component
            .entry(component_id)
            .or_default()
            .push(depends_on_id);
    }
    for d in &mut defs {
        if let Some(deps) = deps_by_component.remove(&d.component.id) {
            d.component.depends_on = deps;
        }
    }
    Ok(defs)
}

/// Recorded scores keyed by student id.
pub fn load_scores(
    conn: &Connection,
    component_ids: &[String],
    student_ids: &[String],
) -> Result<HashMap<String, Vec<RecordedScore>>, CalcError> {
    let mut out: HashMap<String, Vec<RecordedScore>> = HashMap::new();
    if component_ids.is_empty() || student_ids.is_empty() {
        return Ok(out);
    }

    let comp_placeholders = std::iter::repeat("?")
        .take(component_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let stud_placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT component_id, student_id, value
         FROM scores
         WHERE component_id IN ({}) AND student_id IN ({})",
        comp_placeholders, stud_placeholders
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(component_ids.len() + student_ids.len());
    for id in component_ids {
        bind_values.push(Value::Text(id.clone()));
    }
    for id in student_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(RecordedScore {
                component_id: r.get(0)?,
                student_id: r.get(1)?,
                value: r.get(2)?,
            })
        })
        .map_err(db_err)?;
    for row in rows {
        let score = row.map_err(db_err)?;
        out.entry(score.student_id.clone()).or_default().push(score);
    }
    Ok(out)
}

fn grade_rows(
    components: &[EvaluationComponent],
    students: &[RosterStudent],
    scores: &HashMap<String, Vec<RecordedScore>>,
    policy: &GradingPolicy,
) -> Result<Vec<StudentGradeRow>, CalcError> {
    let mut rows = Vec::with_capacity(students.len());
    for s in students {
        let student_scores = scores.get(&s.id).map(Vec::as_slice).unwrap_or(&[]);
        let resolution = resolve_components(components, student_scores, &ArithmeticEvaluator)?;
        let grade = final_grade(components, &resolution, policy);
        rows.push(StudentGradeRow {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            status: s.status,
            sort_order: s.sort_order,
            recorded_count: resolution.recorded.len(),
            values: resolution.values,
            grade,
        });
    }
    Ok(rows)
}

/// One subject/trimester for every student matching `filter` ("mini-pauta").
pub fn compute_trimester_summary(
    ctx: &CalcContext<'_>,
    filter: StudentStatusFilter,
    policy: &GradingPolicy,
) -> Result<TrimesterSummary, CalcError> {
    let class = load_class(ctx.conn, ctx.class_id)?;
    let subject = load_subject(ctx.conn, ctx.class_id, ctx.subject_id)?;
    let defs = load_scope_components(ctx.conn, ctx.subject_id, ctx.trimester)?;
    let students = load_students(ctx.conn, ctx.class_id, filter)?;

    let components: Vec<EvaluationComponent> = defs.iter().map(|d| d.component.clone()).collect();
    let component_ids: Vec<String> = components.iter().map(|c| c.id.clone()).collect();
    let student_ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let scores = load_scores(ctx.conn, &component_ids, &student_ids)?;

    let per_student = grade_rows(&components, &students, &scores, policy)?;
    let finals: Vec<f64> = per_student
        .iter()
        .filter_map(|r| r.grade.final_value)
        .collect();
    let statistics = class_statistics(&finals, policy.pass_mark);
    let not_available_count = per_student.len() - finals.len();

    Ok(TrimesterSummary {
        class,
        subject,
        trimester: ctx.trimester,
        policy: policy.clone(),
        student_status: filter.as_str(),
        components: defs,
        per_student,
        statistics,
        not_available_count,
    })
}

/// Single student, single scope.
pub fn compute_student_row(
    ctx: &CalcContext<'_>,
    student_id: &str,
    policy: &GradingPolicy,
) -> Result<(Vec<ComponentDef>, StudentGradeRow), CalcError> {
    load_subject(ctx.conn, ctx.class_id, ctx.subject_id)?;
    let student = load_students(ctx.conn, ctx.class_id, StudentStatusFilter::All)?
        .into_iter()
        .find(|s| s.id == student_id)
        .ok_or_else(|| CalcError::new("not_found", "student not found"))?;
    let defs = load_scope_components(ctx.conn, ctx.subject_id, ctx.trimester)?;
    let components: Vec<EvaluationComponent> = defs.iter().map(|d| d.component.clone()).collect();
    let component_ids: Vec<String> = components.iter().map(|c| c.id.clone()).collect();
    let scores = load_scores(ctx.conn, &component_ids, &[student.id.clone()])?;
    let mut rows = grade_rows(&components, std::slice::from_ref(&student), &scores, policy)?;
    let row = rows
        .pop()
        .ok_or_else(|| CalcError::new("not_found", "student not found"))?;
    Ok((defs, row))
}

/// Annual outcome per student across every subject of the class.
pub fn compute_annual_summary(
    conn: &Connection,
    class_id: &str,
    filter: StudentStatusFilter,
    policy: &GradingPolicy,
) -> Result<AnnualSummary, CalcError> {
    let class = load_class(conn, class_id)?;
    let subjects = load_subjects(conn, class_id)?;
    let students = load_students(conn, class_id, filter)?;
    let student_ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();

    // (student, subject) -> finals for trimesters 1..=3
    let mut finals: HashMap<(String, String), Vec<Option<f64>>> = HashMap::new();
    for subject in &subjects {
        for trimester in TRIMESTERS {
            let defs = load_scope_components(conn, &subject.id, trimester)?;
            let components: Vec<EvaluationComponent> =
                defs.into_iter().map(|d| d.component).collect();
            let component_ids: Vec<String> = components.iter().map(|c| c.id.clone()).collect();
            let scores = load_scores(conn, &component_ids, &student_ids)?;
            let rows = if components.is_empty() {
                Vec::new()
            } else {
                grade_rows(&components, &students, &scores, policy)?
            };
            let by_student: HashMap<&str, Option<f64>> = rows
                .iter()
                .map(|r| (r.student_id.as_str(), r.grade.final_value))
                .collect();
            for s in &students {
                finals
                    .entry((s.id.clone(), subject.id.clone()))
                    .or_default()
                    .push(by_student.get(s.id.as_str()).copied().flatten());
            }
        }
    }

    let mut per_student: Vec<AnnualStudentRow> = Vec::with_capacity(students.len());
    for s in &students {
        let subject_outcomes = subjects
            .iter()
            .map(|subject| {
                let tf = finals
                    .get(&(s.id.clone(), subject.id.clone()))
                    .cloned()
                    .unwrap_or_default();
                subject_annual(&subject.id, &tf, policy.pass_mark)
            })
            .collect();
        per_student.push(AnnualStudentRow {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            status: s.status,
            sort_order: s.sort_order,
            outcome: student_annual(subject_outcomes, policy.pass_mark),
        });
    }

    let per_subject: Vec<SubjectAnnualStats> = subjects
        .iter()
        .map(|subject| {
            let outcomes: Vec<_> = per_student
                .iter()
                .filter_map(|r| {
                    r.outcome
                        .subjects
                        .iter()
                        .find(|o| o.subject_id == subject.id)
                })
                .collect();
            let averages: Vec<f64> = outcomes.iter().filter_map(|o| o.annual_average).collect();
            SubjectAnnualStats {
                subject: subject.clone(),
                transita_count: outcomes.iter().filter(|o| o.transita).count(),
                statistics: class_statistics(&averages, policy.pass_mark),
            }
        })
        .collect();

    let overall_means: Vec<f64> = per_student
        .iter()
        .filter_map(|r| r.outcome.overall_mean)
        .collect();
    let promoted_count = per_student.iter().filter(|r| r.outcome.promoted).count();

    Ok(AnnualSummary {
        class,
        subjects,
        policy: policy.clone(),
        student_status: filter.as_str(),
        per_student,
        per_subject,
        overall: class_statistics(&overall_means, policy.pass_mark),
        promoted_count,
    })
}
